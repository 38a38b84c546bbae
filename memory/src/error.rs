use std::io;

use thiserror::Error;

use crate::tracking::{MemoryPool, MemoryTrackerKey};

pub type Result<T> = std::result::Result<T, MemoryManagerError>;

/// Caller contract violations rejected by the memory manager.
///
/// None of these are expected at runtime; the manager refuses the operation
/// and leaves its state untouched.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MemoryManagerError {
    #[error("memory tracker {0} already has a tracking group")]
    DuplicateTracker(MemoryTrackerKey),
    #[error("memory tracker {0} has no tracking group")]
    UnknownTracker(MemoryTrackerKey),
    #[error("tracking group is not registered")]
    UnknownTrackingGroup,
    #[error("tracking group is still used by {0} client state(s)")]
    TrackingGroupInUse(usize),
    #[error("client state is not registered")]
    UnknownClientState,
    #[error("freeing {freed} bytes would underflow the {pool} pool ({available} bytes tracked)")]
    AccountingUnderflow {
        pool: MemoryPool,
        freed: u64,
        available: u64,
    },
}

/// Failure to load or validate a [`crate::GpuMemoryConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
