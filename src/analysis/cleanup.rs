//! Stack cleanup after skipped calls.
//!
//! When the block stepper jumps over a call instead of executing it, the
//! callee's own stack adjustment (callee-cleaned conventions such as stdcall)
//! has to be applied by hand. How many bytes to release is a policy question;
//! the answer is reported per call site so consumers can tell a known value
//! from a guess.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::address::VirtualAddress;

/// Stack bytes released by a callee on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "snake_case")]
pub enum StackCleanup {
    /// Cleanup amount known for the resolved target
    Known(u64),
    /// Nothing known; no cleanup applied
    Assumed,
}

impl StackCleanup {
    /// Bytes to add to the stack pointer.
    pub fn bytes(&self) -> u64 {
        match self {
            StackCleanup::Known(bytes) => *bytes,
            StackCleanup::Assumed => 0,
        }
    }

    pub fn is_assumed(&self) -> bool {
        matches!(self, StackCleanup::Assumed)
    }
}

/// Maps a call target (or `None` when unresolved) to its stack cleanup.
pub trait StackCleanupPolicy: Send + Sync {
    fn cleanup(&self, target: Option<VirtualAddress>) -> StackCleanup;
}

impl<F> StackCleanupPolicy for F
where
    F: Fn(Option<VirtualAddress>) -> StackCleanup + Send + Sync,
{
    fn cleanup(&self, target: Option<VirtualAddress>) -> StackCleanup {
        self(target)
    }
}

/// Knows nothing: every call site is `Assumed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCleanup;

impl StackCleanupPolicy for ZeroCleanup {
    fn cleanup(&self, _target: Option<VirtualAddress>) -> StackCleanup {
        StackCleanup::Assumed
    }
}

/// Explicit per-target cleanup amounts, e.g. from a prototypes database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableCleanup {
    entries: HashMap<VirtualAddress, u64>,
}

impl TableCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: VirtualAddress, bytes: u64) {
        self.entries.insert(target, bytes);
    }

    pub fn with(mut self, target: VirtualAddress, bytes: u64) -> Self {
        self.insert(target, bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(VirtualAddress, u64)> for TableCleanup {
    fn from_iter<I: IntoIterator<Item = (VirtualAddress, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl StackCleanupPolicy for TableCleanup {
    fn cleanup(&self, target: Option<VirtualAddress>) -> StackCleanup {
        target
            .and_then(|t| self.entries.get(&t))
            .map_or(StackCleanup::Assumed, |b| StackCleanup::Known(*b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_cleanup_is_assumed() {
        let c = ZeroCleanup.cleanup(Some(VirtualAddress(0x401000)));
        assert!(c.is_assumed());
        assert_eq!(c.bytes(), 0);
    }

    #[test]
    fn test_table_lookup() {
        let table = TableCleanup::new().with(VirtualAddress(0x402000), 8);
        assert_eq!(table.cleanup(Some(VirtualAddress(0x402000))), StackCleanup::Known(8));
        assert_eq!(table.cleanup(Some(VirtualAddress(0x402004))), StackCleanup::Assumed);
        assert_eq!(table.cleanup(None), StackCleanup::Assumed);
    }

    #[test]
    fn test_closure_policy_and_serialization() {
        let policy = |t: Option<VirtualAddress>| match t {
            Some(_) => StackCleanup::Known(4),
            None => StackCleanup::Assumed,
        };
        assert_eq!(policy.cleanup(Some(VirtualAddress(1))).bytes(), 4);
        assert_eq!(
            serde_json::to_string(&StackCleanup::Known(12)).unwrap(),
            r#"{"kind":"known","bytes":12}"#
        );
        assert_eq!(serde_json::to_string(&StackCleanup::Assumed).unwrap(), r#"{"kind":"assumed"}"#);
    }
}
