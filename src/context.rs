use std::cell::Cell;
use std::rc::Rc;

use log::debug;
use memory::{MemoryAllocation, MemoryManagerClient, MemoryTrackerKey};

use crate::ipc::{self, MessageSink};

/// GPU-process side of one command buffer context group.
///
/// Remembers the last budget and front-buffer suggestion it received and
/// forwards changes to the owning renderer over IPC.
pub struct GpuContextClient {
    route: u64,
    tracker: MemoryTrackerKey,
    total_gpu_memory: Option<u64>,
    allocation: Cell<Option<MemoryAllocation>>,
    has_front_buffer: Cell<Option<bool>>,
    sink: Rc<dyn MessageSink>,
}

impl GpuContextClient {
    pub fn new(route: u64, tracker: MemoryTrackerKey, sink: Rc<dyn MessageSink>) -> Self {
        Self {
            route,
            tracker,
            total_gpu_memory: None,
            allocation: Cell::new(None),
            has_front_buffer: Cell::new(None),
            sink,
        }
    }

    /// Total memory of the device as reported by the driver.
    pub fn with_total_gpu_memory(mut self, bytes: u64) -> Self {
        self.total_gpu_memory = Some(bytes);
        self
    }

    pub fn route(&self) -> u64 {
        self.route
    }

    pub fn allocation(&self) -> Option<MemoryAllocation> {
        self.allocation.get()
    }

    pub fn has_front_buffer(&self) -> Option<bool> {
        self.has_front_buffer.get()
    }
}

impl MemoryManagerClient for GpuContextClient {
    fn memory_tracker(&self) -> MemoryTrackerKey {
        self.tracker
    }

    fn set_memory_allocation(&self, allocation: MemoryAllocation) {
        if self.allocation.replace(Some(allocation)) == Some(allocation) {
            return;
        }
        debug!(
            "route {} budget {} bytes ({:?})",
            self.route, allocation.bytes_limit_when_visible, allocation.priority_cutoff_when_visible
        );
        ipc::send_allocation(self.sink.as_ref(), self.route, allocation);
    }

    fn suggest_have_front_buffer(&self, suggest: bool) {
        if self.has_front_buffer.replace(Some(suggest)) == Some(suggest) {
            return;
        }
        ipc::send_front_buffer(self.sink.as_ref(), self.route, suggest);
    }

    fn total_gpu_memory(&self) -> Option<u64> {
        self.total_gpu_memory
    }
}
