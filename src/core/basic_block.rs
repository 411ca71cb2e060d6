//! BasicBlock type for representing straight-line code regions.
//!
//! A block observed by the engine spans from its first instruction up to and
//! including its terminating control-transfer instruction: `end` is the
//! address of that instruction, not one past it. Blocks cut short by a call
//! end at the call's address.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Address of the first instruction
    pub start: VirtualAddress,
    /// Address of the terminating instruction
    pub end: VirtualAddress,
}

impl BasicBlock {
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    /// Whether an address lies within `[start, end]`.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.start && address <= self.end
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb[{}..={}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_inclusive_of_terminator() {
        let bb = BasicBlock::new(VirtualAddress(0x10), VirtualAddress(0x18));
        assert!(bb.contains(VirtualAddress(0x10)));
        assert!(bb.contains(VirtualAddress(0x18)));
        assert!(!bb.contains(VirtualAddress(0x19)));
        assert_eq!(bb.to_string(), "bb[0x10..=0x18]");
    }
}
