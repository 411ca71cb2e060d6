//! Error types for the emuflow analysis engine.
//!
//! Leaf modules own narrow error types (`MemoryError`, `DecodeError`,
//! `EmulatorError`, `ResolveError`); `AnalysisError` is what every engine
//! entry point returns. Recoverable variants end one unit of work (a probe,
//! a block, one function) and never the process.

use thiserror::Error;

use crate::core::address::VirtualAddress;
use crate::core::disassembler::DecodeError;
use crate::emu::EmulatorError;

/// Main error type for emuflow operations.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Malformed or undecodable instruction bytes
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Emulation touched unmapped or guarded memory
    #[error("Invalid fetch at {address} (pc {pc})")]
    InvalidFetch {
        pc: VirtualAddress,
        address: VirtualAddress,
    },

    /// An indirect control transfer could not be resolved
    #[error("Call target unresolved at {at}: {reason}")]
    CallTargetUnresolved { at: VirtualAddress, reason: String },

    /// Step or wall-clock budget exhausted
    #[error("Budget exceeded after {steps} steps ({elapsed_ms}ms)")]
    BudgetExceeded { steps: u64, elapsed_ms: u64 },

    /// Emulator, address space, or hook could not be set up
    #[error("Resource error: {0}")]
    Resource(String),

    /// Instruction the emulator cannot execute (interrupt, halt, unsupported)
    #[error("Emulation error at {pc}: {message}")]
    Emulation { pc: VirtualAddress, message: String },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AnalysisError {
    /// Whether the error ends only the current unit of work.
    ///
    /// Setup failures (`Resource`, `Config`, `Io`) are not recoverable: the
    /// attempted exploration never started.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AnalysisError::Resource(_) | AnalysisError::Config(_) | AnalysisError::Io(_)
        )
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, AnalysisError::BudgetExceeded { .. })
    }
}

impl From<EmulatorError> for AnalysisError {
    fn from(err: EmulatorError) -> Self {
        match err {
            EmulatorError::InvalidFetch { pc, address }
            | EmulatorError::InvalidMemoryAccess { pc, address, .. } => {
                AnalysisError::InvalidFetch { pc, address }
            }
            EmulatorError::InvalidInstruction { pc } => {
                AnalysisError::Decode(DecodeError::InvalidInstruction(pc))
            }
            EmulatorError::StepLimitReached { steps } => AnalysisError::BudgetExceeded {
                steps,
                elapsed_ms: 0,
            },
            other @ EmulatorError::UnknownRegister { .. } => AnalysisError::Resource(other.to_string()),
            other => AnalysisError::Emulation {
                pc: other.pc().unwrap_or_default(),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        AnalysisError::Config(err.to_string())
    }
}

/// Result type alias for emuflow operations
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnalysisError::InvalidFetch {
            pc: VirtualAddress(0x1000),
            address: VirtualAddress(0xdead0000),
        };
        assert_eq!(err.to_string(), "Invalid fetch at 0xdead0000 (pc 0x1000)");

        let err = AnalysisError::BudgetExceeded {
            steps: 10,
            elapsed_ms: 3,
        };
        assert_eq!(err.to_string(), "Budget exceeded after 10 steps (3ms)");
    }

    #[test]
    fn test_recoverability() {
        assert!(AnalysisError::CallTargetUnresolved {
            at: VirtualAddress(0),
            reason: "x".into()
        }
        .is_recoverable());
        assert!(AnalysisError::BudgetExceeded {
            steps: 1,
            elapsed_ms: 0
        }
        .is_recoverable());
        assert!(!AnalysisError::Resource("no stack".into()).is_recoverable());
        assert!(!AnalysisError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_emulator_error_mapping() {
        let err: AnalysisError = EmulatorError::InvalidMemoryAccess {
            pc: VirtualAddress(0x10),
            address: VirtualAddress(0x20),
            write: true,
        }
        .into();
        assert!(matches!(err, AnalysisError::InvalidFetch { .. }));

        let err: AnalysisError = EmulatorError::StepLimitReached { steps: 5 }.into();
        assert!(err.is_budget_exceeded());

        let err: AnalysisError = EmulatorError::Interrupt {
            pc: VirtualAddress(0x10),
            mnemonic: "int3".into(),
        }
        .into();
        assert!(matches!(err, AnalysisError::Emulation { pc: VirtualAddress(0x10), .. }));
    }
}
