use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::{debug, trace, warn};
use scheduler::{ManageScheduler, ScheduleTime, TimerToken};
use slotmap::SlotMap;
use util::ProcessId;

use crate::allocation::{MemoryAllocation, PriorityCutoff};
use crate::client::{ClientList, ClientState, ClientStateId, MemoryManagerClient};
use crate::config::{GpuMemoryConfig, Platform};
use crate::error::{MemoryManagerError, Result};
use crate::stats::{
    GpuMemoryUmaStats, NoopStatsReporter, StatsReporter, VideoMemoryUsageStats,
};
use crate::tracking::{MemoryPool, MemoryTrackerKey, TrackingGroup, TrackingGroupId};

/// Budget manager shared by every GPU context in the GPU process.
///
/// All methods take `&self` and must be called from a single thread. State
/// changes are visible to queries immediately, but allocation decisions are
/// only pushed to clients by a recompute pass, which runs when the host calls
/// [`GpuMemoryManager::poll`] or [`GpuMemoryManager::fire_timer`]. Clients may
/// call back into the manager while a pass delivers their allocation; such
/// calls only schedule another pass.
pub struct GpuMemoryManager {
    config: GpuMemoryConfig,
    process_id: ProcessId,
    scheduler: ManageScheduler,
    reporter: Rc<dyn StatsReporter>,
    state: RefCell<ManagerState>,
}

impl GpuMemoryManager {
    pub fn new(config: GpuMemoryConfig) -> Self {
        Self::with_process_id(config, ProcessId::current())
    }

    /// Creates a manager whose own process is reported as `process_id`.
    pub fn with_process_id(config: GpuMemoryConfig, process_id: ProcessId) -> Self {
        let state = ManagerState {
            client_hard_limit_bytes: config.initial_client_hard_limit_bytes(),
            bytes_allocated_unmanaged_high: config.bytes_allocated_step,
            ..ManagerState::default()
        };
        Self {
            scheduler: ManageScheduler::new(config.delayed_manage_timeout()),
            config,
            process_id,
            reporter: Rc::new(NoopStatsReporter),
            state: RefCell::new(state),
        }
    }

    /// Routes per-pass stats to `reporter`.
    pub fn with_stats_reporter<R: StatsReporter + 'static>(mut self, reporter: Rc<R>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &GpuMemoryConfig {
        &self.config
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Registers the accounting bucket for one memory tracker.
    pub fn create_tracking_group(
        &self,
        process_id: ProcessId,
        tracker: MemoryTrackerKey,
    ) -> Result<TrackingGroupId> {
        let mut state = self.state.borrow_mut();
        if state.groups_by_tracker.contains_key(&tracker) {
            warn!("memory tracker {tracker} registered twice");
            return Err(MemoryManagerError::DuplicateTracker(tracker));
        }
        let id = state
            .tracking_groups
            .insert(TrackingGroup::new(process_id, tracker));
        state.groups_by_tracker.insert(tracker, id);
        debug!("tracking group {id:?} created for tracker {tracker} in process {process_id}");
        Ok(id)
    }

    /// Unregisters a tracking group. Bytes still charged to it are released.
    pub fn destroy_tracking_group(&self, id: TrackingGroupId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.tracking_groups.contains_key(id) {
            warn!("destroying unknown tracking group {id:?}");
            return Err(MemoryManagerError::UnknownTrackingGroup);
        }
        let users = state
            .clients
            .values()
            .filter(|client| client.tracking_group == id)
            .count();
        if users > 0 {
            warn!("tracking group {id:?} destroyed while {users} client state(s) use it");
            return Err(MemoryManagerError::TrackingGroupInUse(users));
        }

        let Some(group) = state.tracking_groups.remove(id) else {
            return Err(MemoryManagerError::UnknownTrackingGroup);
        };
        state.groups_by_tracker.remove(&group.tracker());
        if group.size() > 0 {
            debug!(
                "tracking group {id:?} destroyed with {} bytes still tracked",
                group.size()
            );
        }
        state.bytes_allocated_managed_current = state
            .bytes_allocated_managed_current
            .saturating_sub(group.pool_bytes(MemoryPool::Managed));
        state.bytes_allocated_unmanaged_current = state
            .bytes_allocated_unmanaged_current
            .saturating_sub(group.pool_bytes(MemoryPool::Unmanaged));
        Ok(())
    }

    /// Registers a client whose tracker already has a tracking group.
    ///
    /// The manager only keeps a weak reference to `client`.
    pub fn create_client_state<C: MemoryManagerClient + 'static>(
        &self,
        client: &Rc<C>,
        has_surface: bool,
        visible: bool,
    ) -> Result<ClientStateId> {
        let tracker = client.memory_tracker();
        let id = {
            let mut state = self.state.borrow_mut();
            let Some(&group) = state.groups_by_tracker.get(&tracker) else {
                warn!("client registered against unknown memory tracker {tracker}");
                return Err(MemoryManagerError::UnknownTracker(tracker));
            };
            let weak: Weak<C> = Rc::downgrade(client);
            let weak: Weak<dyn MemoryManagerClient> = weak;
            let id = state
                .clients
                .insert(ClientState::new(weak, group, has_surface, visible));
            state
                .list_mut(ClientList::for_state(has_surface, visible))
                .push_front(id);
            id
        };

        trace!("client state {id:?} created (surface: {has_surface}, visible: {visible})");
        self.schedule_manage(ScheduleTime::Now);
        Ok(id)
    }

    pub fn destroy_client_state(&self, id: ClientStateId) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let Some(client) = state.clients.remove(id) else {
                warn!("destroying unknown client state {id:?}");
                return Err(MemoryManagerError::UnknownClientState);
            };
            state.remove_from_list(id, client.list());
        }

        trace!("client state {id:?} destroyed");
        self.schedule_manage(ScheduleTime::Later);
        Ok(())
    }

    /// Moves a client to the most-recently-used slot of its new list.
    ///
    /// Becoming visible is urgent; becoming hidden is batched.
    pub fn set_client_visible(&self, id: ClientStateId, visible: bool) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            let (old_list, new_list) = {
                let Some(client) = state.clients.get_mut(id) else {
                    warn!("visibility change for unknown client state {id:?}");
                    return Err(MemoryManagerError::UnknownClientState);
                };
                if client.visible == visible {
                    return Ok(());
                }
                let old_list = client.list();
                client.visible = visible;
                (old_list, client.list())
            };
            state.remove_from_list(id, old_list);
            state.list_mut(new_list).push_front(id);
        }

        trace!("client state {id:?} visible: {visible}");
        self.schedule_manage(if visible {
            ScheduleTime::Now
        } else {
            ScheduleTime::Later
        });
        Ok(())
    }

    /// Records a change in the bytes a tracking group holds in `pool`.
    pub fn track_memory_allocated_change(
        &self,
        group: TrackingGroupId,
        old_size: u64,
        new_size: u64,
        pool: MemoryPool,
    ) -> Result<()> {
        let (reschedule, report) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(tracking_group) = state.tracking_groups.get_mut(group) else {
                warn!("allocation change for unknown tracking group {group:?}");
                return Err(MemoryManagerError::UnknownTrackingGroup);
            };
            let total = match pool {
                MemoryPool::Managed => &mut state.bytes_allocated_managed_current,
                MemoryPool::Unmanaged => &mut state.bytes_allocated_unmanaged_current,
            };
            let group_bytes = tracking_group.pool_bytes_mut(pool);

            if new_size < old_size {
                let freed = old_size - new_size;
                let available = (*total).min(*group_bytes);
                if freed > available {
                    warn!("tracking group {group:?} freed {freed} {pool} bytes but holds {available}");
                    return Err(MemoryManagerError::AccountingUnderflow {
                        pool,
                        freed,
                        available,
                    });
                }
                *total -= freed;
                *group_bytes -= freed;
            } else {
                let grown = new_size - old_size;
                *total = total.saturating_add(grown);
                *group_bytes = group_bytes.saturating_add(grown);
            }

            if new_size != old_size {
                trace!(
                    "tracking group {group:?} {pool} bytes {old_size} -> {new_size}, pool total {}",
                    *total
                );
            }

            let mut reschedule = None;
            if pool == MemoryPool::Unmanaged {
                // Unmanaged memory moving out of its band shifts what is left for everyone else.
                if state.bytes_allocated_unmanaged_current >= state.bytes_allocated_unmanaged_high {
                    reschedule = Some(ScheduleTime::Now);
                } else if state.bytes_allocated_unmanaged_current
                    < state.bytes_allocated_unmanaged_low
                {
                    reschedule = Some(ScheduleTime::Later);
                }
            }

            let current = state.current_usage();
            let report = current
                > state
                    .bytes_allocated_historical_max
                    .saturating_add(self.config.bytes_allocated_step);
            if report {
                state.bytes_allocated_historical_max = current;
            }
            (reschedule, report)
        };

        if let Some(when) = reschedule {
            self.schedule_manage(when);
        }
        if report {
            self.send_uma_stats();
        }
        Ok(())
    }

    /// Bytes held by the tracking group of `client`, or `None` if its tracker is unregistered.
    pub fn client_memory_usage<C: MemoryManagerClient + ?Sized>(&self, client: &C) -> Option<u64> {
        let tracker = client.memory_tracker();
        let state = self.state.borrow();
        let id = state.groups_by_tracker.get(&tracker)?;
        state.tracking_groups.get(*id).map(TrackingGroup::size)
    }

    /// Per-process breakdown of tracked memory.
    ///
    /// The manager's own process carries the whole total and is flagged as
    /// overlapping the other entries.
    pub fn video_memory_usage_stats(&self) -> VideoMemoryUsageStats {
        let state = self.state.borrow();
        let mut stats = VideoMemoryUsageStats::default();
        for group in state.tracking_groups.values() {
            let entry = stats.process_map.entry(group.process_id()).or_default();
            entry.video_memory = entry.video_memory.saturating_add(group.size());
        }

        let current = state.current_usage();
        let own = stats.process_map.entry(self.process_id).or_default();
        own.video_memory = current;
        own.has_duplicates = true;

        stats.bytes_allocated = current;
        stats.bytes_allocated_historical_max = state.bytes_allocated_historical_max;
        stats
    }

    /// Runs a recompute pass if one is due at `now`. Returns whether it ran.
    pub fn poll(&self, now: Instant) -> bool {
        if !self.scheduler.is_due(now) {
            return false;
        }
        self.manage();
        true
    }

    /// Debounce timer the host should arm, if any.
    pub fn pending_timer(&self) -> Option<TimerToken> {
        self.scheduler.pending_timer()
    }

    /// Runs the deferred pass for `token` unless the timer was cancelled since.
    pub fn fire_timer(&self, token: TimerToken) -> bool {
        if !self.scheduler.is_current(token) {
            trace!("ignoring stale recompute timer (generation {})", token.generation);
            return false;
        }
        self.manage();
        true
    }

    /// When the host should next call [`GpuMemoryManager::poll`].
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.scheduler.next_deadline(now)
    }

    pub fn is_manage_scheduled(&self) -> bool {
        !self.scheduler.is_idle()
    }

    pub fn is_immediate_manage_scheduled(&self) -> bool {
        self.scheduler.is_immediate_scheduled()
    }

    pub fn is_delayed_manage_scheduled(&self) -> bool {
        self.scheduler.is_timer_armed()
    }

    /// Recomputes hibernation and pushes an allocation to every client.
    pub fn manage(&self) {
        self.scheduler.begin_pass();
        self.update_available_gpu_memory();

        let (deliveries, stats) = {
            let mut state = self.state.borrow_mut();
            state.set_clients_hibernated_state(self.config.max_surfaces_with_frontbuffer_soft_limit);
            let deliveries = state.assign_allocations(self.config.platform);
            state.update_unmanaged_memory_limits(self.config.bytes_allocated_step);
            (deliveries, state.uma_stats())
        };

        debug!(
            "memory pass: {} clients, {} groups, limit {} bytes, usage {} bytes",
            stats.client_count, stats.context_group_count, stats.bytes_limit, stats.bytes_allocated_current
        );

        // Borrows are released here so clients can call back in.
        for delivery in deliveries {
            delivery.deliver();
        }
        self.reporter.report_uma_stats(stats);
    }

    fn schedule_manage(&self, when: ScheduleTime) {
        self.scheduler.schedule(when);
    }

    fn send_uma_stats(&self) {
        let stats = self.state.borrow().uma_stats();
        self.reporter.report_uma_stats(stats);
    }

    fn update_available_gpu_memory(&self) {
        if let Some(forced) = self.config.forced_client_hard_limit_bytes() {
            self.state.borrow_mut().client_hard_limit_bytes = forced;
            return;
        }

        match self.config.platform {
            Platform::Desktop => {
                self.state.borrow_mut().client_hard_limit_bytes =
                    self.config.desktop_client_hard_limit_bytes;
            }
            Platform::Mobile => {
                // Only visible clients are asked; the full set can be very large.
                let clients: Vec<_> = {
                    let state = self.state.borrow();
                    state
                        .clients_visible_mru
                        .iter()
                        .filter_map(|id| state.clients.get(*id))
                        .filter_map(ClientState::client)
                        .collect()
                };
                let bytes_min = clients
                    .iter()
                    .filter_map(|client| client.total_gpu_memory())
                    .filter(|bytes| *bytes > 0)
                    .min();
                let Some(bytes_min) = bytes_min else {
                    return;
                };

                let limit = bytes_min
                    .max(self.config.mobile_min_client_hard_limit_bytes)
                    .min(self.config.mobile_max_client_hard_limit_bytes);
                self.state.borrow_mut().client_hard_limit_bytes = limit;
            }
        }
    }

    pub fn client_hard_limit_bytes(&self) -> u64 {
        self.state.borrow().client_hard_limit_bytes
    }

    /// Bytes tracked across both pools.
    pub fn current_usage(&self) -> u64 {
        self.state.borrow().current_usage()
    }

    pub fn pool_usage(&self, pool: MemoryPool) -> u64 {
        let state = self.state.borrow();
        match pool {
            MemoryPool::Managed => state.bytes_allocated_managed_current,
            MemoryPool::Unmanaged => state.bytes_allocated_unmanaged_current,
        }
    }

    pub fn bytes_allocated_historical_max(&self) -> u64 {
        self.state.borrow().bytes_allocated_historical_max
    }

    pub fn client_count(&self) -> usize {
        self.state.borrow().clients.len()
    }

    pub fn tracking_group_count(&self) -> usize {
        self.state.borrow().tracking_groups.len()
    }

    /// `true` once every client state and tracking group has been destroyed.
    pub fn is_empty(&self) -> bool {
        let state = self.state.borrow();
        state.clients.is_empty()
            && state.tracking_groups.is_empty()
            && state.groups_by_tracker.is_empty()
            && state.clients_visible_mru.is_empty()
            && state.clients_nonvisible_mru.is_empty()
            && state.clients_nonsurface.is_empty()
    }

    pub fn client_list(&self, id: ClientStateId) -> Option<ClientList> {
        self.state.borrow().clients.get(id).map(ClientState::list)
    }

    /// Hibernation decided by the last pass.
    pub fn is_client_hibernated(&self, id: ClientStateId) -> Option<bool> {
        self.state.borrow().clients.get(id).map(|client| client.hibernated)
    }

    pub fn tracking_group(&self, id: TrackingGroupId) -> Option<TrackingGroup> {
        self.state.borrow().tracking_groups.get(id).cloned()
    }

    pub fn tracking_group_for(&self, tracker: MemoryTrackerKey) -> Option<TrackingGroupId> {
        self.state.borrow().groups_by_tracker.get(&tracker).copied()
    }

    /// Client states of `list`, most recently used first.
    pub fn mru_clients(&self, list: ClientList) -> Vec<ClientStateId> {
        self.state.borrow().list(list).iter().copied().collect()
    }
}

struct Delivery {
    client: Rc<dyn MemoryManagerClient>,
    allocation: MemoryAllocation,
    front_buffer: Option<bool>,
}

impl Delivery {
    fn deliver(self) {
        self.client.set_memory_allocation(self.allocation);
        if let Some(front_buffer) = self.front_buffer {
            self.client.suggest_have_front_buffer(front_buffer);
        }
    }
}

#[derive(Default)]
struct ManagerState {
    tracking_groups: SlotMap<TrackingGroupId, TrackingGroup>,
    groups_by_tracker: HashMap<MemoryTrackerKey, TrackingGroupId>,
    clients: SlotMap<ClientStateId, ClientState>,
    clients_visible_mru: VecDeque<ClientStateId>,
    clients_nonvisible_mru: VecDeque<ClientStateId>,
    clients_nonsurface: VecDeque<ClientStateId>,
    client_hard_limit_bytes: u64,
    bytes_allocated_managed_current: u64,
    bytes_allocated_unmanaged_current: u64,
    bytes_allocated_historical_max: u64,
    bytes_allocated_unmanaged_high: u64,
    bytes_allocated_unmanaged_low: u64,
}

impl ManagerState {
    fn list(&self, list: ClientList) -> &VecDeque<ClientStateId> {
        match list {
            ClientList::VisibleWithSurface => &self.clients_visible_mru,
            ClientList::NonvisibleWithSurface => &self.clients_nonvisible_mru,
            ClientList::NoSurface => &self.clients_nonsurface,
        }
    }

    fn list_mut(&mut self, list: ClientList) -> &mut VecDeque<ClientStateId> {
        match list {
            ClientList::VisibleWithSurface => &mut self.clients_visible_mru,
            ClientList::NonvisibleWithSurface => &mut self.clients_nonvisible_mru,
            ClientList::NoSurface => &mut self.clients_nonsurface,
        }
    }

    fn remove_from_list(&mut self, id: ClientStateId, list: ClientList) {
        let entries = self.list_mut(list);
        if let Some(index) = entries.iter().position(|entry| *entry == id) {
            entries.remove(index);
        }
    }

    fn current_usage(&self) -> u64 {
        self.bytes_allocated_managed_current
            .saturating_add(self.bytes_allocated_unmanaged_current)
    }

    fn set_clients_hibernated_state(&mut self, soft_limit: usize) {
        for group in self.tracking_groups.values_mut() {
            group.set_hibernated(true);
        }

        let mut non_hibernated = 0usize;
        for id in &self.clients_visible_mru {
            let Some(client) = self.clients.get_mut(*id) else {
                continue;
            };
            client.hibernated = false;
            if let Some(group) = self.tracking_groups.get_mut(client.tracking_group) {
                group.set_hibernated(false);
            }
            non_hibernated += 1;
        }

        // Visible clients count toward the limit too.
        for id in &self.clients_nonvisible_mru {
            let Some(client) = self.clients.get_mut(*id) else {
                continue;
            };
            if non_hibernated < soft_limit {
                client.hibernated = false;
                if let Some(group) = self.tracking_groups.get_mut(client.tracking_group) {
                    group.set_hibernated(false);
                }
                non_hibernated += 1;
            } else {
                client.hibernated = true;
            }
        }

        // Offscreen contexts follow whatever surface shares their group.
        for id in &self.clients_nonsurface {
            let Some(client) = self.clients.get_mut(*id) else {
                continue;
            };
            client.hibernated = self
                .tracking_groups
                .get(client.tracking_group)
                .map(TrackingGroup::hibernated)
                .unwrap_or(true);
        }
    }

    fn assign_allocations(&self, platform: Platform) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(self.clients.len());
        let limit = self.client_hard_limit_bytes;

        let surfaced = self
            .clients_visible_mru
            .iter()
            .chain(self.clients_nonvisible_mru.iter());
        for id in surfaced {
            let Some(state) = self.clients.get(*id) else {
                continue;
            };
            let Some(client) = state.client() else {
                warn!("client state {id:?} outlived its client");
                continue;
            };
            deliveries.push(Delivery {
                client,
                allocation: MemoryAllocation::new(limit, platform.surface_priority_cutoff()),
                front_buffer: Some(!state.hibernated),
            });
        }

        for id in &self.clients_nonsurface {
            let Some(state) = self.clients.get(*id) else {
                continue;
            };
            let Some(client) = state.client() else {
                warn!("client state {id:?} outlived its client");
                continue;
            };
            let allocation = if state.hibernated {
                MemoryAllocation::default()
            } else {
                MemoryAllocation::new(limit, PriorityCutoff::AllowEverything)
            };
            deliveries.push(Delivery {
                client,
                allocation,
                front_buffer: None,
            });
        }

        deliveries
    }

    fn update_unmanaged_memory_limits(&mut self, step: u64) {
        let current = self.bytes_allocated_unmanaged_current;
        self.bytes_allocated_unmanaged_high = current.saturating_add(step);
        self.bytes_allocated_unmanaged_low = current.saturating_sub(step);
    }

    fn uma_stats(&self) -> GpuMemoryUmaStats {
        GpuMemoryUmaStats {
            bytes_allocated_current: self.current_usage(),
            bytes_allocated_max: self.bytes_allocated_historical_max,
            bytes_limit: self.client_hard_limit_bytes,
            client_count: self.clients.len(),
            context_group_count: self.tracking_groups.len(),
        }
    }
}
