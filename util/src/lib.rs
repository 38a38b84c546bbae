use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Converts a size in mebibytes to bytes, saturating on overflow.
pub fn mib(value: u64) -> u64 {
    value.saturating_mul(MIB)
}

/// Operating system process identifier of a GPU client or of the GPU process itself.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Creates a new `ProcessId` from a raw pid.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the id of the calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Returns the raw pid.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simple monotonic id generator for in-process identifiers.
#[derive(Debug)]
pub struct IdGenerator {
    next: Cell<u64>,
}

impl IdGenerator {
    /// Creates a new generator starting at the provided value.
    pub fn new(start: u64) -> Self {
        Self {
            next: Cell::new(start),
        }
    }

    /// Returns the next id in sequence.
    pub fn next(&self) -> u64 {
        let id = self.next.get();
        self.next.set(id.wrapping_add(1));
        id
    }

    /// Returns the id the next call to [`IdGenerator::next`] will hand out.
    pub fn peek(&self) -> u64 {
        self.next.get()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
