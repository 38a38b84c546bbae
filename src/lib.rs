//! GPU process glue for OwL Browser.
//!
//! Wires the memory manager to the outside world: the browser-side registry
//! of GPU process hosts, channel establishment, and the JSON messages that
//! carry budgets and statistics.

pub mod channel;
pub mod context;
pub mod host;
pub mod ipc;

pub use channel::{ChannelError, ChannelHandle, ChannelOutcome, EstablishChannelRequest, EstablishState};
pub use context::GpuContextClient;
pub use host::{GpuProcessHost, GpuProcessHostRegistry, GpuProcessKind, HostId, HostState};
pub use ipc::{IpcError, IpcStatsReporter, MessageSink};
