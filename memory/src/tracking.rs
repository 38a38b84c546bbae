use std::fmt;

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use util::ProcessId;

new_key_type! {
    /// Handle to a tracking group registered with the memory manager.
    pub struct TrackingGroupId;
}

/// Opaque identity of the memory tracker shared by one GPU context group.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryTrackerKey(u64);

impl MemoryTrackerKey {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemoryTrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Accounting pool a GPU allocation is charged to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPool {
    /// Resources the client evicts on request (textures, tiles).
    Managed,
    /// Resources outside the client's eviction policy (WebGL, canvas).
    Unmanaged,
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPool::Managed => f.write_str("managed"),
            MemoryPool::Unmanaged => f.write_str("unmanaged"),
        }
    }
}

/// Per context group accounting bucket.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TrackingGroup {
    process_id: ProcessId,
    tracker: MemoryTrackerKey,
    managed_bytes: u64,
    unmanaged_bytes: u64,
    hibernated: bool,
}

impl TrackingGroup {
    pub(crate) fn new(process_id: ProcessId, tracker: MemoryTrackerKey) -> Self {
        Self {
            process_id,
            tracker,
            managed_bytes: 0,
            unmanaged_bytes: 0,
            hibernated: false,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn tracker(&self) -> MemoryTrackerKey {
        self.tracker
    }

    /// Bytes currently charged to `pool`.
    pub fn pool_bytes(&self, pool: MemoryPool) -> u64 {
        match pool {
            MemoryPool::Managed => self.managed_bytes,
            MemoryPool::Unmanaged => self.unmanaged_bytes,
        }
    }

    /// Total bytes across both pools.
    pub fn size(&self) -> u64 {
        self.managed_bytes.saturating_add(self.unmanaged_bytes)
    }

    /// Whether the last recompute pass left every client of the group without a front buffer.
    pub fn hibernated(&self) -> bool {
        self.hibernated
    }

    pub(crate) fn set_hibernated(&mut self, hibernated: bool) {
        self.hibernated = hibernated;
    }

    pub(crate) fn pool_bytes_mut(&mut self, pool: MemoryPool) -> &mut u64 {
        match pool {
            MemoryPool::Managed => &mut self.managed_bytes,
            MemoryPool::Unmanaged => &mut self.unmanaged_bytes,
        }
    }
}
