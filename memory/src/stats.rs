use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use util::ProcessId;

/// Aggregate numbers reported to the browser after every recompute pass.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GpuMemoryUmaStats {
    pub bytes_allocated_current: u64,
    pub bytes_allocated_max: u64,
    pub bytes_limit: u64,
    pub client_count: usize,
    pub context_group_count: usize,
}

/// Telemetry sink for [`GpuMemoryUmaStats`]. Reports are fire-and-forget.
pub trait StatsReporter {
    fn report_uma_stats(&self, stats: GpuMemoryUmaStats);
}

/// Reporter used when no telemetry sink is wired.
#[derive(Debug, Default)]
pub struct NoopStatsReporter;

impl StatsReporter for NoopStatsReporter {
    fn report_uma_stats(&self, _stats: GpuMemoryUmaStats) {}
}

/// Reporter that keeps every report for later inspection.
#[derive(Debug, Default)]
pub struct RecordingStatsReporter {
    reports: RefCell<Vec<GpuMemoryUmaStats>>,
}

impl RecordingStatsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<GpuMemoryUmaStats> {
        self.reports.borrow().clone()
    }

    pub fn last(&self) -> Option<GpuMemoryUmaStats> {
        self.reports.borrow().last().copied()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<GpuMemoryUmaStats> {
        self.reports.take()
    }
}

impl StatsReporter for RecordingStatsReporter {
    fn report_uma_stats(&self, stats: GpuMemoryUmaStats) {
        self.reports.borrow_mut().push(stats);
    }
}

/// GPU memory attributed to one process.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessVideoMemory {
    pub video_memory: u64,
    /// Set when the figure overlaps other entries of the same report.
    pub has_duplicates: bool,
}

/// Per-process breakdown of tracked GPU memory.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VideoMemoryUsageStats {
    pub process_map: BTreeMap<ProcessId, ProcessVideoMemory>,
    pub bytes_allocated: u64,
    pub bytes_allocated_historical_max: u64,
}

impl VideoMemoryUsageStats {
    pub fn for_process(&self, process_id: ProcessId) -> Option<ProcessVideoMemory> {
        self.process_map.get(&process_id).copied()
    }
}
