//! GPU memory budget manager.
//!
//! Tracks how much GPU memory each context group holds, decides which
//! surfaces stay resident and which hibernate, and tells every client what
//! budget it may use.

pub mod allocation;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod stats;
pub mod tracking;

pub use allocation::{MemoryAllocation, PriorityCutoff};
pub use client::{ClientList, ClientStateId, MemoryManagerClient};
pub use config::{GpuMemoryConfig, Platform, FORCE_GPU_MEM_AVAILABLE_MB_ENV};
pub use error::{ConfigError, MemoryManagerError};
pub use manager::GpuMemoryManager;
pub use stats::{
    GpuMemoryUmaStats, NoopStatsReporter, ProcessVideoMemory, RecordingStatsReporter,
    StatsReporter, VideoMemoryUsageStats,
};
pub use tracking::{MemoryPool, MemoryTrackerKey, TrackingGroup, TrackingGroupId};

pub use scheduler::TimerToken;
