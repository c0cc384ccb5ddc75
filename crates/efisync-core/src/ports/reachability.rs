//! Reachability probe port

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::TransferError;

/// Reachability of the remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unknown => write!(f, "unknown"),
            Reachability::Reachable => write!(f, "reachable"),
            Reachability::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[async_trait::async_trait]
pub trait IReachabilityProbe: Send + Sync {
    /// Connect to `address` and close again, returning the connect latency
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, TransferError>;
}
