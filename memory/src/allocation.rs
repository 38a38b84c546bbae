use serde::{Deserialize, Serialize};

/// How aggressively a client may keep cached GPU resources resident.
///
/// Variants are ordered from most to least restrictive.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityCutoff {
    /// Drop everything.
    #[default]
    AllowNothing,
    /// Keep only resources needed to draw the visible content.
    AllowRequiredOnly,
    /// Also keep resources that are likely to be needed soon.
    AllowNiceToHave,
    /// Cache everything that fits.
    AllowEverything,
}

/// Budget decision sent to a client on every recompute pass.
///
/// The default value is the empty allocation handed to hibernated clients
/// without a surface.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryAllocation {
    pub bytes_limit_when_visible: u64,
    pub priority_cutoff_when_visible: PriorityCutoff,
}

impl MemoryAllocation {
    pub fn new(bytes_limit_when_visible: u64, priority_cutoff_when_visible: PriorityCutoff) -> Self {
        Self {
            bytes_limit_when_visible,
            priority_cutoff_when_visible,
        }
    }

    /// Returns `true` if the allocation grants nothing.
    pub fn is_empty(&self) -> bool {
        self.bytes_limit_when_visible == 0
            && self.priority_cutoff_when_visible == PriorityCutoff::AllowNothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allocation_is_empty() {
        let allocation = MemoryAllocation::default();
        assert!(allocation.is_empty());
        assert!(!MemoryAllocation::new(1, PriorityCutoff::AllowNothing).is_empty());
    }

    #[test]
    fn cutoffs_order_from_restrictive_to_permissive() {
        assert!(PriorityCutoff::AllowNothing < PriorityCutoff::AllowRequiredOnly);
        assert!(PriorityCutoff::AllowRequiredOnly < PriorityCutoff::AllowNiceToHave);
        assert!(PriorityCutoff::AllowNiceToHave < PriorityCutoff::AllowEverything);
    }

    #[test]
    fn serializes_cutoff_in_snake_case() {
        let allocation = MemoryAllocation::new(64, PriorityCutoff::AllowNiceToHave);
        let json = serde_json::to_string(&allocation).unwrap();
        assert_eq!(
            json,
            r#"{"bytes_limit_when_visible":64,"priority_cutoff_when_visible":"allow_nice_to_have"}"#
        );
    }
}
