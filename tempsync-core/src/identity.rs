//! Worker identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque worker identifier, chosen by the worker and sent in SYN/ACK.
/// Unique among the workers registered with one coordinator.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub i64);

impl WorkerId {
    /// Identifier derived from the current OS process id.
    pub fn from_process() -> Self {
        WorkerId(i64::from(std::process::id()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
