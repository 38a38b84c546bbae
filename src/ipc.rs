use log::{trace, warn};
use memory::{
    GpuMemoryManager, GpuMemoryUmaStats, MemoryAllocation, StatsReporter, VideoMemoryUsageStats,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MEMORY_UMA_STATS: &str = "gpu.memory_uma_stats";
pub const VIDEO_MEMORY_USAGE: &str = "gpu.video_memory_usage";
pub const MEMORY_ALLOCATION: &str = "gpu.memory_allocation";
pub const FRONT_BUFFER: &str = "gpu.front_buffer";
pub const GET_VIDEO_MEMORY_USAGE: &str = "gpu.get_video_memory_usage";

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub r#type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OutgoingMessage<'a, T> {
    pub r#type: &'a str,
    pub payload: T,
}

#[derive(Debug, Serialize)]
pub struct AllocationState {
    pub route: u64,
    pub allocation: MemoryAllocation,
}

#[derive(Debug, Serialize)]
pub struct FrontBufferState {
    pub route: u64,
    pub suggest: bool,
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// Receives encoded messages bound for the browser process.
pub trait MessageSink {
    fn send(&self, json: String);
}

impl<F: Fn(String)> MessageSink for F {
    fn send(&self, json: String) {
        self(json)
    }
}

pub fn send_uma_stats(sink: &dyn MessageSink, stats: &GpuMemoryUmaStats) {
    let message = OutgoingMessage {
        r#type: MEMORY_UMA_STATS,
        payload: stats,
    };
    send_to_browser(sink, &message);
}

pub fn send_video_memory_usage(sink: &dyn MessageSink, stats: &VideoMemoryUsageStats) {
    let message = OutgoingMessage {
        r#type: VIDEO_MEMORY_USAGE,
        payload: stats,
    };
    send_to_browser(sink, &message);
}

pub fn send_allocation(sink: &dyn MessageSink, route: u64, allocation: MemoryAllocation) {
    let message = OutgoingMessage {
        r#type: MEMORY_ALLOCATION,
        payload: AllocationState { route, allocation },
    };
    send_to_browser(sink, &message);
}

pub fn send_front_buffer(sink: &dyn MessageSink, route: u64, suggest: bool) {
    let message = OutgoingMessage {
        r#type: FRONT_BUFFER,
        payload: FrontBufferState { route, suggest },
    };
    send_to_browser(sink, &message);
}

/// Answers a request from the browser process.
pub fn handle_incoming(
    manager: &GpuMemoryManager,
    sink: &dyn MessageSink,
    json: &str,
) -> Result<(), IpcError> {
    let message: IncomingMessage = serde_json::from_str(json)?;
    match message.r#type.as_str() {
        GET_VIDEO_MEMORY_USAGE => {
            send_video_memory_usage(sink, &manager.video_memory_usage_stats());
            Ok(())
        }
        _ => Err(IpcError::UnknownType(message.r#type)),
    }
}

fn send_to_browser<T: Serialize>(sink: &dyn MessageSink, message: &OutgoingMessage<T>) {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(err) => {
            warn!("dropping {} message: {err}", message.r#type);
            return;
        }
    };
    trace!("-> {json}");
    sink.send(json);
}

/// Forwards the manager's per-pass statistics over IPC.
pub struct IpcStatsReporter<S> {
    sink: S,
}

impl<S: MessageSink> IpcStatsReporter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: MessageSink> StatsReporter for IpcStatsReporter<S> {
    fn report_uma_stats(&self, stats: GpuMemoryUmaStats) {
        send_uma_stats(&self.sink, &stats);
    }
}
