//! Decoder trait and error types for instruction decoding.
//!
//! This module defines the `Decoder` trait that provides a common interface
//! for decoder backends, plus the architecture descriptor shared by the
//! decoder and the emulator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;
use crate::core::address_space::{AddressSpace, MemoryError};
use crate::core::instruction::Instruction;

/// Errors that can occur while decoding an instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Invalid or undecodable instruction bytes
    #[error("invalid instruction encoding at {0}")]
    InvalidInstruction(VirtualAddress),
    /// The instruction bytes could not be read
    #[error("cannot read instruction bytes: {0}")]
    Memory(#[from] MemoryError),
    /// Unsupported architecture for the selected backend
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

/// Result type for decode operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Architectures the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// x86 (32-bit)
    X86,
    /// x86-64 (64-bit)
    X86_64,
}

impl Architecture {
    /// Address size in bits
    pub fn address_bits(&self) -> u32 {
        match self {
            Architecture::X86 => 32,
            Architecture::X86_64 => 64,
        }
    }

    /// Native pointer width in bytes (one stack slot)
    pub fn word_size(&self) -> u64 {
        u64::from(self.address_bits() / 8)
    }

    pub fn is_64_bit(&self) -> bool {
        self.address_bits() == 64
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// Core decoder trait: one instruction at one virtual address.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction from `bytes`, located at `address`.
    fn decode_bytes(&self, address: VirtualAddress, bytes: &[u8]) -> DecodeResult<Instruction>;

    /// Maximum instruction length for this architecture in bytes
    fn max_instruction_length(&self) -> usize;

    /// Architecture this decoder handles
    fn architecture(&self) -> Architecture;

    /// Decode the instruction at `address` within `space`.
    fn decode(&self, space: &dyn AddressSpace, address: VirtualAddress) -> DecodeResult<Instruction> {
        let bytes = space.read_up_to(address, self.max_instruction_length())?;
        self.decode_bytes(address, &bytes)
    }

    /// Human-readable backend name
    fn name(&self) -> &str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address_space::{ImageAddressSpace, Permissions, Region};
    use crate::core::instruction::InstructionGroups;

    #[test]
    fn test_architecture_widths() {
        assert_eq!(Architecture::X86.address_bits(), 32);
        assert_eq!(Architecture::X86.word_size(), 4);
        assert_eq!(Architecture::X86_64.word_size(), 8);
        assert!(Architecture::X86_64.is_64_bit());
        assert_eq!(Architecture::X86_64.to_string(), "x86_64");
    }

    #[test]
    fn test_default_decode_reads_through_space() {
        // Every byte decodes as a one-byte "nop".
        struct ByteDecoder;

        impl Decoder for ByteDecoder {
            fn decode_bytes(&self, address: VirtualAddress, bytes: &[u8]) -> DecodeResult<Instruction> {
                match bytes.first() {
                    Some(b) => Ok(Instruction::new(address, vec![*b], "nop", vec![], InstructionGroups::empty())),
                    None => Err(DecodeError::InvalidInstruction(address)),
                }
            }

            fn max_instruction_length(&self) -> usize {
                4
            }

            fn architecture(&self) -> Architecture {
                Architecture::X86
            }
        }

        let mut img = ImageAddressSpace::new();
        img.map(Region::new("code", VirtualAddress(0x10), 2, &[0xaa, 0xbb], Permissions::RX))
            .unwrap();
        let ins = ByteDecoder.decode(&img, VirtualAddress(0x11)).unwrap();
        assert_eq!(ins.bytes, vec![0xbb]);
        assert!(matches!(
            ByteDecoder.decode(&img, VirtualAddress(0x12)),
            Err(DecodeError::Memory(MemoryError::Unmapped(_)))
        ));
        assert_eq!(ByteDecoder.name(), "generic");
    }
}
