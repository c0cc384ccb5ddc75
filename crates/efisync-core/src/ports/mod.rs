//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ITaskStore`] - Durable backing store of the operation queue
//! - [`IRecordStore`] - The detector's last-known record table
//! - [`IEventSink`] - Structured notification of sync events
//! - [`ITransferExecutor`] - Performs one verified transfer
//! - [`IRemoteCatalog`] - Lists files held by the remote endpoint
//! - [`IReachabilityProbe`] - Cheap connect-and-close probe of the endpoint

pub mod event_sink;
pub mod reachability;
pub mod record_store;
pub mod task_store;
pub mod transfer;

pub use event_sink::{IEventSink, SyncEvent};
pub use reachability::{IReachabilityProbe, Reachability};
pub use record_store::{IRecordStore, RecordMap};
pub use task_store::ITaskStore;
pub use transfer::{IRemoteCatalog, ITransferExecutor, TransferOutcome};
