use std::rc::{Rc, Weak};

use slotmap::new_key_type;

use crate::allocation::MemoryAllocation;
use crate::tracking::{MemoryTrackerKey, TrackingGroupId};

new_key_type! {
    /// Handle to a client state. The registering caller owns it and must
    /// destroy it with [`crate::GpuMemoryManager::destroy_client_state`].
    pub struct ClientStateId;
}

/// A GPU context group consuming memory under the manager's budget.
pub trait MemoryManagerClient {
    /// Key of the memory tracker the client's context group reports to.
    fn memory_tracker(&self) -> MemoryTrackerKey;

    /// Delivers the budget decided by a recompute pass.
    fn set_memory_allocation(&self, allocation: MemoryAllocation);

    /// Asks the client to keep (`true`) or release (`false`) its front buffer.
    fn suggest_have_front_buffer(&self, suggest: bool);

    /// Total GPU memory reported by the client's driver, if it knows.
    ///
    /// Only queried on platforms that size the budget from the device.
    fn total_gpu_memory(&self) -> Option<u64> {
        None
    }
}

/// Ordered collection a client state lives in.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ClientList {
    /// Visible clients with a surface, most recently used first.
    VisibleWithSurface,
    /// Hidden clients with a surface, most recently used first.
    NonvisibleWithSurface,
    /// Offscreen clients. Order does not affect decisions.
    NoSurface,
}

impl ClientList {
    /// The list a client belongs to is determined only by these two flags.
    pub fn for_state(has_surface: bool, visible: bool) -> Self {
        match (has_surface, visible) {
            (true, true) => ClientList::VisibleWithSurface,
            (true, false) => ClientList::NonvisibleWithSurface,
            (false, _) => ClientList::NoSurface,
        }
    }
}

pub(crate) struct ClientState {
    client: Weak<dyn MemoryManagerClient>,
    pub(crate) tracking_group: TrackingGroupId,
    pub(crate) has_surface: bool,
    pub(crate) visible: bool,
    pub(crate) hibernated: bool,
}

impl ClientState {
    pub(crate) fn new(
        client: Weak<dyn MemoryManagerClient>,
        tracking_group: TrackingGroupId,
        has_surface: bool,
        visible: bool,
    ) -> Self {
        Self {
            client,
            tracking_group,
            has_surface,
            visible,
            hibernated: false,
        }
    }

    pub(crate) fn list(&self) -> ClientList {
        ClientList::for_state(self.has_surface, self.visible)
    }

    pub(crate) fn client(&self) -> Option<Rc<dyn MemoryManagerClient>> {
        self.client.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_follows_surface_and_visibility() {
        assert_eq!(ClientList::for_state(true, true), ClientList::VisibleWithSurface);
        assert_eq!(ClientList::for_state(true, false), ClientList::NonvisibleWithSurface);
        assert_eq!(ClientList::for_state(false, true), ClientList::NoSurface);
        assert_eq!(ClientList::for_state(false, false), ClientList::NoSurface);
    }
}
