//! Cross-reference types observed during emulation.
//!
//! Each kind is its own type rather than a variant of a shared base, so a
//! consumer that only cares about calls cannot be handed a memory access by
//! mistake. A call whose target could not be resolved is still recorded,
//! with an absent `to`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;

/// Control transfer by a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallXref {
    pub from: VirtualAddress,
    /// `None` when the target was unresolved
    pub to: Option<VirtualAddress>,
}

/// Observed edge between basic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JumpXref {
    pub from: VirtualAddress,
    pub to: VirtualAddress,
}

/// Memory read performed by the instruction at `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryReadXref {
    pub from: VirtualAddress,
    pub to: VirtualAddress,
}

/// Memory write performed by the instruction at `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryWriteXref {
    pub from: VirtualAddress,
    pub to: VirtualAddress,
}

impl fmt::Display for CallXref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "call {} -> {}", self.from, to),
            None => write!(f, "call {} -> ?", self.from),
        }
    }
}

impl fmt::Display for JumpXref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jump {} -> {}", self.from, self.to)
    }
}

impl fmt::Display for MemoryReadXref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "read {} -> {}", self.from, self.to)
    }
}

impl fmt::Display for MemoryWriteXref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write {} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let c = CallXref {
            from: VirtualAddress(0x10),
            to: None,
        };
        assert_eq!(c.to_string(), "call 0x10 -> ?");
        let j = JumpXref {
            from: VirtualAddress(0x10),
            to: VirtualAddress(0x20),
        };
        assert_eq!(j.to_string(), "jump 0x10 -> 0x20");
    }

    #[test]
    fn test_unresolved_call_serializes_null() {
        let c = CallXref {
            from: VirtualAddress(0x10),
            to: None,
        };
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"from":16,"to":null}"#);
    }
}
