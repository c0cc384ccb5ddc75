//! Domain entities and business logic
//!
//! This module contains the core domain types for EFISync:
//! - Newtypes for identifiers, fingerprints and relative paths
//! - File records and transfer tasks
//! - The error kind policy table
//! - Cycle results and managed volumes

pub mod error_kind;
pub mod errors;
pub mod file_record;
pub mod newtypes;
pub mod sync_result;
pub mod task;
pub mod volume;

// Re-export commonly used types
pub use error_kind::{ErrorClass, ErrorKind, TransferError};
pub use errors::DomainError;
pub use file_record::FileRecord;
pub use newtypes::*;
pub use sync_result::{CycleError, CycleStatus, CycleTrigger, SyncResult};
pub use task::{TaskError, TaskKind, TaskState, TransferTask};
pub use volume::ManagedVolume;
