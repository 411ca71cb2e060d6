//! CPU emulation collaborators.
//!
//! The analysis engine drives any type implementing [`Emulator`]; the crate
//! ships [`x86::X86Emulator`], a coarse x86/x86-64 interpreter, and the
//! [`excursion::ExcursionManager`] that makes speculative probes
//! side-effect free.

pub mod excursion;
pub mod hooks;
pub mod memory;
pub mod state;
pub mod x86;

use serde::{Deserialize, Serialize};

use crate::core::address::VirtualAddress;
use crate::core::address_space::AddressSpace;
use crate::core::disassembler::Architecture;
use crate::error::AnalysisError;

pub use excursion::{Excursion, ExcursionManager};
pub use hooks::HookHandle;
pub use x86::{X86Emulator, X86EmulatorFactory};

/// Errors raised by a single emulator operation.
///
/// A failed step leaves the emulator exactly as it was before the step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmulatorError {
    /// Instruction fetch or control transfer into unmapped or
    /// non-executable memory
    #[error("invalid fetch of {address} at {pc}")]
    InvalidFetch {
        pc: VirtualAddress,
        address: VirtualAddress,
    },
    #[error("invalid memory {} of {address} at {pc}", access_word(.write))]
    InvalidMemoryAccess {
        pc: VirtualAddress,
        address: VirtualAddress,
        write: bool,
    },
    #[error("undecodable instruction at {pc}")]
    InvalidInstruction { pc: VirtualAddress },
    #[error("unsupported instruction {mnemonic} at {pc}")]
    UnsupportedInstruction { pc: VirtualAddress, mnemonic: String },
    /// Software interrupt, trap, halt, or system call
    #[error("{mnemonic} at {pc} stops emulation")]
    Interrupt { pc: VirtualAddress, mnemonic: String },
    #[error("divide error at {pc}")]
    DivideError { pc: VirtualAddress },
    #[error("step limit reached after {steps} steps")]
    StepLimitReached { steps: u64 },
    /// A stepped-over callee did not return within its allowance
    #[error("callee of call at {pc} did not return within {steps} steps")]
    CalleeDidNotReturn { pc: VirtualAddress, steps: u64 },
    #[error("unknown register {name}")]
    UnknownRegister { name: String },
}

fn access_word(write: &bool) -> &'static str {
    if *write {
        "write"
    } else {
        "read"
    }
}

impl EmulatorError {
    /// Address of the instruction that raised the error, when known.
    pub fn pc(&self) -> Option<VirtualAddress> {
        match self {
            EmulatorError::InvalidFetch { pc, .. }
            | EmulatorError::InvalidMemoryAccess { pc, .. }
            | EmulatorError::InvalidInstruction { pc }
            | EmulatorError::UnsupportedInstruction { pc, .. }
            | EmulatorError::Interrupt { pc, .. }
            | EmulatorError::DivideError { pc }
            | EmulatorError::CalleeDidNotReturn { pc, .. } => Some(*pc),
            EmulatorError::StepLimitReached { .. } | EmulatorError::UnknownRegister { .. } => None,
        }
    }

    /// Faults caused by touching memory the program cannot use.
    pub fn is_invalid_fetch(&self) -> bool {
        matches!(
            self,
            EmulatorError::InvalidFetch { .. } | EmulatorError::InvalidMemoryAccess { .. }
        )
    }
}

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

/// One memory access performed by an executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// Instruction that performed the access
    pub pc: VirtualAddress,
    pub address: VirtualAddress,
    pub size: usize,
    pub kind: AccessKind,
    /// Value read or written, little-endian, truncated to `size`
    pub value: u64,
}

/// One executed instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEvent {
    pub address: VirtualAddress,
    pub size: u32,
    /// Encoded instruction bytes as executed
    pub bytes: Vec<u8>,
}

pub type CodeCallback = Box<dyn FnMut(&CodeEvent)>;
pub type MemoryCallback = Box<dyn FnMut(&MemoryAccess)>;

/// Sequential CPU state machine driven by the analysis engine.
///
/// Steps are atomic: they either complete and fire hooks, or fail and leave
/// all state untouched. Hooks fire synchronously after the step commits,
/// the code event first, then memory events in the order they occurred.
/// Callbacks receive events only; they have no way to reach the emulator.
pub trait Emulator: AddressSpace {
    /// Full saved state: registers, flags, and memory.
    type Snapshot;

    fn architecture(&self) -> Architecture;

    /// Size of one stack slot in bytes.
    fn word_size(&self) -> u64 {
        self.architecture().word_size()
    }

    fn instruction_pointer(&self) -> VirtualAddress;
    fn set_instruction_pointer(&mut self, address: VirtualAddress);
    fn stack_pointer(&self) -> VirtualAddress;
    fn set_stack_pointer(&mut self, address: VirtualAddress);

    /// Read a register by lowercase name (`eax`, `r11d`, `ah`, `rip`).
    fn register_value(&self, name: &str) -> Result<u64, EmulatorError>;
    fn set_register_value(&mut self, name: &str, value: u64) -> Result<(), EmulatorError>;

    /// Execute one instruction, following calls into the callee.
    fn step_into(&mut self) -> Result<(), EmulatorError>;

    /// Execute one instruction; a call runs until its callee returns.
    ///
    /// Callee instructions fire no hooks. On failure the emulator is left as
    /// it was before the call.
    fn step_over(&mut self) -> Result<(), EmulatorError>;

    /// Step into until the instruction pointer equals `target`, without
    /// executing the instruction there. Returns the number of steps taken.
    fn run_to(&mut self, target: VirtualAddress, max_steps: u64) -> Result<u64, EmulatorError> {
        let mut steps = 0;
        while self.instruction_pointer() != target {
            if steps >= max_steps {
                return Err(EmulatorError::StepLimitReached { steps });
            }
            self.step_into()?;
            steps += 1;
        }
        Ok(steps)
    }

    fn hook_code(&mut self, callback: CodeCallback) -> HookHandle;
    fn hook_memory_read(&mut self, callback: MemoryCallback) -> HookHandle;
    fn hook_memory_write(&mut self, callback: MemoryCallback) -> HookHandle;

    /// Suppress or re-enable hook dispatch. Returns the previous setting.
    fn set_hooks_muted(&mut self, muted: bool) -> bool;

    fn snapshot(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: Self::Snapshot);

    /// Instructions executed since creation. Never rewound by `restore`.
    fn steps_executed(&self) -> u64;
}

/// Creates fresh, independent emulator instances over a shared image.
pub trait EmulatorFactory: Sync {
    type Emulator: Emulator;

    fn create_emulator(&self) -> Result<Self::Emulator, AnalysisError>;
}

impl<F: EmulatorFactory + ?Sized> EmulatorFactory for &F {
    type Emulator = F::Emulator;

    fn create_emulator(&self) -> Result<Self::Emulator, AnalysisError> {
        (**self).create_emulator()
    }
}
