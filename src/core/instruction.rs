//! Instruction and Operand types for decoded instructions.
//!
//! The model is deliberately coarse: control-flow decisions only need the
//! operand kind of the transfer and the instruction's semantic groups, so
//! operands carry register names rather than architecture register ids.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;

bitflags! {
    /// Coarse semantic groups an instruction belongs to.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InstructionGroups: u16 {
        const CALL = 1 << 0;
        const JUMP = 1 << 1;
        const RETURN = 1 << 2;
        const INTERRUPT_RETURN = 1 << 3;
        /// Conditional control transfer (jcc)
        const CONDITIONAL = 1 << 4;
        /// Target computed at runtime (register or memory operand)
        const INDIRECT = 1 << 5;
        /// Software interrupt, trap, or halt
        const INTERRUPT = 1 << 6;
    }
}

/// Structured operand representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Immediate value; direct branch targets are absolute immediates.
    Immediate(u64),
    /// Register operand by lowercase name (e.g. `eax`, `r11`).
    Register(String),
    /// Memory reference. RIP-relative references are normalized to
    /// `base: None` with the absolute address as displacement.
    Memory {
        base: Option<String>,
        index: Option<String>,
        scale: u8,
        displacement: i64,
    },
}

impl Operand {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Operand::Immediate(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register(_))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Memory { .. })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Immediate(v) => write!(f, "{:#x}", v),
            Operand::Register(name) => write!(f, "{}", name),
            Operand::Memory {
                base,
                index,
                scale,
                displacement,
            } => {
                let mut parts: Vec<String> = Vec::new();
                if let Some(b) = base {
                    parts.push(b.clone());
                }
                if let Some(i) = index {
                    if *scale > 1 {
                        parts.push(format!("{}*{}", i, scale));
                    } else {
                        parts.push(i.clone());
                    }
                }
                if *displacement != 0 || parts.is_empty() {
                    if *displacement < 0 && !parts.is_empty() {
                        parts.push(format!("-{:#x}", displacement.unsigned_abs()));
                    } else {
                        parts.push(format!("{:#x}", displacement));
                    }
                }
                write!(f, "[{}]", parts.join("+").replace("+-", "-"))
            }
        }
    }
}

/// A decoded instruction at a specific address. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: VirtualAddress,
    /// Encoded length in bytes
    pub size: u32,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub groups: InstructionGroups,
}

impl Instruction {
    pub fn new(
        address: VirtualAddress,
        bytes: Vec<u8>,
        mnemonic: impl Into<String>,
        operands: Vec<Operand>,
        groups: InstructionGroups,
    ) -> Self {
        Self {
            address,
            size: bytes.len() as u32,
            bytes,
            mnemonic: mnemonic.into(),
            operands,
            groups,
        }
    }

    pub fn is_call(&self) -> bool {
        self.groups.contains(InstructionGroups::CALL)
    }

    pub fn is_jump(&self) -> bool {
        self.groups.contains(InstructionGroups::JUMP)
    }

    pub fn is_conditional(&self) -> bool {
        self.groups.contains(InstructionGroups::CONDITIONAL)
    }

    pub fn is_indirect(&self) -> bool {
        self.groups.contains(InstructionGroups::INDIRECT)
    }

    /// Return or interrupt-return: leaves the function.
    pub fn is_return(&self) -> bool {
        self.groups
            .intersects(InstructionGroups::RETURN | InstructionGroups::INTERRUPT_RETURN)
    }

    /// Ends a basic block in the function-level walk (call, jump, or return).
    pub fn is_block_end(&self) -> bool {
        self.is_call() || self.is_jump() || self.is_return()
    }

    /// Address of the sequentially following instruction.
    pub fn next_address(&self) -> VirtualAddress {
        self.address + self.size as u64
    }

    /// The statically known branch target of a direct call/jump.
    pub fn direct_target(&self) -> Option<VirtualAddress> {
        if self.is_indirect() {
            return None;
        }
        match self.operands.first() {
            Some(Operand::Immediate(v)) => Some(VirtualAddress(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops: Vec<String> = self.operands.iter().map(|o| o.to_string()).collect();
        if ops.is_empty() {
            write!(f, "{}: {}", self.address, self.mnemonic)
        } else {
            write!(f, "{}: {} {}", self.address, self.mnemonic, ops.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_imm() -> Instruction {
        Instruction::new(
            VirtualAddress(0x1000),
            vec![0xe8, 0xfb, 0x0f, 0x00, 0x00],
            "call",
            vec![Operand::Immediate(0x2000)],
            InstructionGroups::CALL,
        )
    }

    #[test]
    fn test_control_flow_detection() {
        let call = call_imm();
        assert!(call.is_call());
        assert!(call.is_block_end());
        assert!(!call.is_return());
        assert_eq!(call.direct_target(), Some(VirtualAddress(0x2000)));
        assert_eq!(call.next_address(), VirtualAddress(0x1005));

        let iret = Instruction::new(
            VirtualAddress(0x1000),
            vec![0xcf],
            "iretd",
            vec![],
            InstructionGroups::INTERRUPT_RETURN,
        );
        assert!(iret.is_return());
        assert!(iret.is_block_end());
    }

    #[test]
    fn test_indirect_has_no_direct_target() {
        let ins = Instruction::new(
            VirtualAddress(0x1000),
            vec![0xff, 0xd0],
            "call",
            vec![Operand::Register("eax".into())],
            InstructionGroups::CALL | InstructionGroups::INDIRECT,
        );
        assert_eq!(ins.direct_target(), None);
    }

    #[test]
    fn test_operand_display() {
        let mem = Operand::Memory {
            base: Some("ebp".into()),
            index: Some("ecx".into()),
            scale: 4,
            displacement: -8,
        };
        assert_eq!(mem.to_string(), "[ebp+ecx*4-0x8]");
        let abs = Operand::Memory {
            base: None,
            index: None,
            scale: 1,
            displacement: 0x402000,
        };
        assert_eq!(abs.to_string(), "[0x402000]");
        assert_eq!(call_imm().to_string(), "0x1000: call 0x2000");
    }
}
