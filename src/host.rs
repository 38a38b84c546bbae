use std::collections::HashMap;
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;
use util::{IdGenerator, ProcessId};

/// Crashes tolerated before GPU access is blocked for the session.
pub const DEFAULT_MAX_GPU_CRASHES: u32 = 3;

/// Stable identifier of a GPU process host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct HostId(u64);

impl HostId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GpuProcessKind {
    Sandboxed,
    Unsandboxed,
}

impl GpuProcessKind {
    fn slot(self) -> usize {
        match self {
            GpuProcessKind::Sandboxed => 0,
            GpuProcessKind::Unsandboxed => 1,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HostState {
    /// Process requested but not yet running.
    Launching,
    Running(ProcessId),
    Crashed,
}

/// Browser-side record of one GPU process.
#[derive(Debug, Clone)]
pub struct GpuProcessHost {
    id: HostId,
    kind: GpuProcessKind,
    state: HostState,
}

impl GpuProcessHost {
    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn kind(&self) -> GpuProcessKind {
        self.kind
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        match self.state {
            HostState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    /// A host stays usable until its process crashes.
    pub fn is_valid(&self) -> bool {
        self.state != HostState::Crashed
    }
}

/// Owns every GPU process host of a browser session.
///
/// At most one valid host exists per [`GpuProcessKind`]. The registry is an
/// ordinary value; callers pass it where hosts are looked up.
#[derive(Debug)]
pub struct GpuProcessHostRegistry {
    hosts: HashMap<HostId, GpuProcessHost>,
    by_kind: [Option<HostId>; 2],
    ids: IdGenerator,
    crash_count: u32,
    max_crashes: u32,
}

impl GpuProcessHostRegistry {
    pub fn new() -> Self {
        Self::with_max_crashes(DEFAULT_MAX_GPU_CRASHES)
    }

    pub fn with_max_crashes(max_crashes: u32) -> Self {
        Self {
            hosts: HashMap::new(),
            by_kind: [None, None],
            ids: IdGenerator::default(),
            crash_count: 0,
            max_crashes,
        }
    }

    /// `false` once the GPU process crashed too often.
    pub fn gpu_access_allowed(&self) -> bool {
        self.crash_count < self.max_crashes
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    /// Returns the valid host for `kind`, launching one if needed.
    ///
    /// Returns `None` when GPU access is blocked.
    pub fn get_or_create(&mut self, kind: GpuProcessKind) -> Option<HostId> {
        if let Some(host) = self.get(kind) {
            return Some(host.id());
        }
        if !self.gpu_access_allowed() {
            warn!("GPU access blocked after {} crashes", self.crash_count);
            return None;
        }

        let id = HostId::new(self.ids.next());
        self.hosts.insert(
            id,
            GpuProcessHost {
                id,
                kind,
                state: HostState::Launching,
            },
        );
        self.by_kind[kind.slot()] = Some(id);
        info!("launching {kind:?} GPU process host {id}");
        Some(id)
    }

    /// The valid host for `kind`, if one exists.
    pub fn get(&self, kind: GpuProcessKind) -> Option<&GpuProcessHost> {
        let id = self.by_kind[kind.slot()]?;
        self.hosts.get(&id).filter(|host| host.is_valid())
    }

    pub fn from_id(&self, id: HostId) -> Option<&GpuProcessHost> {
        self.hosts.get(&id)
    }

    pub fn on_process_launched(&mut self, id: HostId, pid: ProcessId) -> bool {
        let Some(host) = self.hosts.get_mut(&id) else {
            return false;
        };
        if host.state != HostState::Launching {
            return false;
        }
        host.state = HostState::Running(pid);
        debug!("GPU process host {id} running as pid {pid}");
        true
    }

    /// Marks the host dead. The next lookup for its kind launches a new one.
    pub fn on_process_crashed(&mut self, id: HostId) -> bool {
        let Some(host) = self.hosts.get_mut(&id) else {
            return false;
        };
        if !host.is_valid() {
            return false;
        }
        host.state = HostState::Crashed;
        let slot = host.kind.slot();
        if self.by_kind[slot] == Some(id) {
            self.by_kind[slot] = None;
        }
        self.crash_count += 1;
        warn!("GPU process host {id} crashed ({} so far)", self.crash_count);
        true
    }

    pub fn remove(&mut self, id: HostId) -> Option<GpuProcessHost> {
        let host = self.hosts.remove(&id)?;
        let slot = host.kind.slot();
        if self.by_kind[slot] == Some(id) {
            self.by_kind[slot] = None;
        }
        Some(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl Default for GpuProcessHostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_valid_host_per_kind() {
        let mut registry = GpuProcessHostRegistry::new();
        let sandboxed = registry.get_or_create(GpuProcessKind::Sandboxed).unwrap();
        assert_eq!(registry.get_or_create(GpuProcessKind::Sandboxed), Some(sandboxed));

        let unsandboxed = registry.get_or_create(GpuProcessKind::Unsandboxed).unwrap();
        assert_ne!(sandboxed, unsandboxed);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn crashed_host_is_replaced() {
        let mut registry = GpuProcessHostRegistry::new();
        let first = registry.get_or_create(GpuProcessKind::Sandboxed).unwrap();
        assert!(registry.on_process_launched(first, ProcessId::new(42)));
        assert_eq!(
            registry.from_id(first).unwrap().process_id(),
            Some(ProcessId::new(42))
        );

        assert!(registry.on_process_crashed(first));
        assert!(!registry.on_process_crashed(first));
        assert!(registry.get(GpuProcessKind::Sandboxed).is_none());

        let second = registry.get_or_create(GpuProcessKind::Sandboxed).unwrap();
        assert_ne!(first, second);
        assert!(!registry.from_id(first).unwrap().is_valid());
    }

    #[test]
    fn repeated_crashes_block_gpu_access() {
        let mut registry = GpuProcessHostRegistry::with_max_crashes(2);
        for _ in 0..2 {
            let id = registry.get_or_create(GpuProcessKind::Sandboxed).unwrap();
            registry.on_process_crashed(id);
        }
        assert!(!registry.gpu_access_allowed());
        assert_eq!(registry.get_or_create(GpuProcessKind::Sandboxed), None);
    }

    #[test]
    fn independent_registries_do_not_share_hosts() {
        let mut first = GpuProcessHostRegistry::new();
        let second = GpuProcessHostRegistry::new();
        let id = first.get_or_create(GpuProcessKind::Sandboxed).unwrap();

        assert!(second.from_id(id).is_none());
        assert!(first.remove(id).is_some());
        assert!(first.is_empty());
    }
}
