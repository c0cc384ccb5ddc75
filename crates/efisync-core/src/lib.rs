//! EFISync Core - Domain types and port definitions
//!
//! This crate holds the pieces every other EFISync crate agrees on:
//! - **Domain entities** - `FileRecord`, `TransferTask`, `SyncResult`, `ManagedVolume`
//! - **Error taxonomy** - `ErrorKind` and its retryable / terminal classification
//! - **Configuration** - the typed, validated-once `Config`
//! - **Port definitions** - traits for adapters: `ITaskStore`, `IRecordStore`,
//!   `IEventSink`, `ITransferExecutor`, `IReachabilityProbe`
//!
//! # Architecture
//!
//! The domain module has no I/O. Ports define the trait interfaces that the
//! sync engine depends on and that adapter crates (SQLite, TCP) implement.

pub mod config;
pub mod domain;
pub mod ports;
