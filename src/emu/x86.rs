//! Coarse x86/x86-64 interpreter over iced-x86.
//!
//! Covers the integer subset compiled code uses around control flow: data
//! movement, stack operations, arithmetic and logic, shifts, multiply and
//! divide, conditional moves and sets, and every near control transfer.
//! Anything else (floating point, SIMD, string instructions, far transfers,
//! segment overrides) stops emulation with `UnsupportedInstruction`.
//!
//! Each step runs against a cloned register file and a write buffer; only a
//! step that completes is committed.

use std::sync::Arc;

use iced_x86::{FlowControl, Mnemonic, OpKind, Register};
use tracing::trace;

use super::hooks::Hooks;
use super::memory::EmulatorMemory;
use super::state::{mask, sign_extend, CpuState, RegRef, RAX, RBP, RCX, RDX, RSP};
use super::{
    AccessKind, CodeCallback, CodeEvent, Emulator, EmulatorError, EmulatorFactory, HookHandle,
    MemoryAccess, MemoryCallback,
};
use crate::config::StackConfig;
use crate::core::address::VirtualAddress;
use crate::core::address_space::{AddressSpace, ImageAddressSpace, MemoryError, Permissions};
use crate::core::disassembler::Architecture;
use crate::disasm::IcedDecoder;
use crate::error::AnalysisError;

/// Default instruction allowance for a stepped-over callee
pub const DEFAULT_MAX_CALLEE_STEPS: u64 = 100_000;

pub struct X86Emulator {
    arch: Architecture,
    decoder: IcedDecoder,
    state: CpuState,
    memory: EmulatorMemory,
    hooks: Hooks,
    steps: u64,
    max_callee_steps: u64,
}

/// Saved registers and memory of an [`X86Emulator`].
#[derive(Debug, Clone)]
pub struct X86Snapshot {
    state: CpuState,
    memory: EmulatorMemory,
}

impl X86Snapshot {
    pub fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress(self.state.ip)
    }
}

/// Events of one executed instruction, dispatched after commit.
struct StepRecord {
    code: CodeEvent,
    accesses: Vec<MemoryAccess>,
}

impl std::fmt::Debug for X86Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X86Emulator")
            .field("arch", &self.arch)
            .field("ip", &VirtualAddress(self.state.ip))
            .field("steps", &self.steps)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl X86Emulator {
    /// Create an emulator over `image` with no stack mapped.
    pub fn new(arch: Architecture, image: Arc<ImageAddressSpace>) -> Self {
        Self {
            arch,
            decoder: IcedDecoder::new(arch),
            state: CpuState::default(),
            memory: EmulatorMemory::new(image),
            hooks: Hooks::new(),
            steps: 0,
            max_callee_steps: DEFAULT_MAX_CALLEE_STEPS,
        }
    }

    /// Create an emulator with a mapped stack and the stack pointer set.
    pub fn with_stack(
        arch: Architecture,
        image: Arc<ImageAddressSpace>,
        stack: &StackConfig,
    ) -> Result<Self, MemoryError> {
        let mut emu = Self::new(arch, image);
        emu.memory
            .map_anonymous("stack", VirtualAddress(stack.base), stack.size, Permissions::RW)?;
        emu.set_stack_pointer(VirtualAddress(stack.initial_pointer()));
        Ok(emu)
    }

    pub fn with_max_callee_steps(mut self, max: u64) -> Self {
        self.max_callee_steps = max;
        self
    }

    pub fn memory(&self) -> &EmulatorMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut EmulatorMemory {
        &mut self.memory
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    fn address_mask(&self) -> u64 {
        mask(self.arch.word_size() as usize)
    }

    fn fetch(&self) -> Result<(iced_x86::Instruction, Vec<u8>), EmulatorError> {
        let pc = VirtualAddress(self.state.ip);
        let fault = EmulatorError::InvalidFetch { pc, address: pc };
        match self.memory.permissions(pc) {
            Some(p) if p.contains(Permissions::X) => {}
            _ => return Err(fault),
        }
        let bytes = self
            .memory
            .read_up_to(pc, 15)
            .map_err(|_| fault.clone())?;
        let instr = self
            .decoder
            .decode_raw(pc, &bytes)
            .map_err(|_| EmulatorError::InvalidInstruction { pc })?;
        let len = instr.len().min(bytes.len());
        Ok((instr, bytes[..len].to_vec()))
    }

    /// Execute and commit one instruction without dispatching hooks.
    fn step_inner(&mut self) -> Result<StepRecord, EmulatorError> {
        let (instr, bytes) = self.fetch()?;
        let pc = VirtualAddress(self.state.ip);
        let mut exec = Exec {
            memory: &self.memory,
            instr: &instr,
            arch: self.arch,
            pc,
            state: self.state.clone(),
            writes: Vec::new(),
            accesses: Vec::new(),
        };
        exec.run()?;
        let Exec {
            state,
            writes,
            accesses,
            ..
        } = exec;

        for (address, data) in &writes {
            self.memory
                .write(*address, data)
                .map_err(|_| EmulatorError::InvalidMemoryAccess {
                    pc,
                    address: *address,
                    write: true,
                })?;
        }
        self.state = state;
        self.steps += 1;

        Ok(StepRecord {
            code: CodeEvent {
                address: pc,
                size: bytes.len() as u32,
                bytes,
            },
            accesses,
        })
    }
}

impl AddressSpace for X86Emulator {
    fn read(&self, address: VirtualAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.memory.read(address, len)
    }

    fn permissions(&self, address: VirtualAddress) -> Option<Permissions> {
        self.memory.permissions(address)
    }
}

impl Emulator for X86Emulator {
    type Snapshot = X86Snapshot;

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress(self.state.ip)
    }

    fn set_instruction_pointer(&mut self, address: VirtualAddress) {
        self.state.ip = address.value() & self.address_mask();
    }

    fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress(self.state.gpr[RSP] & self.address_mask())
    }

    fn set_stack_pointer(&mut self, address: VirtualAddress) {
        self.state.gpr[RSP] = address.value() & self.address_mask();
    }

    fn register_value(&self, name: &str) -> Result<u64, EmulatorError> {
        if matches!(name, "rip" | "eip" | "ip") {
            return Ok(self.state.ip);
        }
        RegRef::from_name(name)
            .map(|r| self.state.read(r))
            .ok_or_else(|| EmulatorError::UnknownRegister { name: name.to_string() })
    }

    fn set_register_value(&mut self, name: &str, value: u64) -> Result<(), EmulatorError> {
        if matches!(name, "rip" | "eip" | "ip") {
            self.set_instruction_pointer(VirtualAddress(value));
            return Ok(());
        }
        let r = RegRef::from_name(name)
            .ok_or_else(|| EmulatorError::UnknownRegister { name: name.to_string() })?;
        self.state.write(r, value);
        Ok(())
    }

    fn step_into(&mut self) -> Result<(), EmulatorError> {
        let record = self.step_inner()?;
        self.hooks.dispatch(&record.code, &record.accesses);
        Ok(())
    }

    fn step_over(&mut self) -> Result<(), EmulatorError> {
        let (instr, _) = self.fetch()?;
        if !matches!(
            instr.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        ) {
            return self.step_into();
        }

        let pc = VirtualAddress(self.state.ip);
        let return_to = instr.next_ip() & self.address_mask();
        let sp_before = self.stack_pointer();
        let saved = self.snapshot();

        let record = self.step_inner()?;
        let mut callee_steps = 0;
        let result = loop {
            if self.state.ip == return_to && self.stack_pointer() >= sp_before {
                break Ok(());
            }
            if callee_steps >= self.max_callee_steps {
                break Err(EmulatorError::CalleeDidNotReturn {
                    pc,
                    steps: callee_steps,
                });
            }
            if let Err(e) = self.step_inner() {
                break Err(e);
            }
            callee_steps += 1;
        };

        match result {
            Ok(()) => {
                trace!(%pc, callee_steps, "stepped over call");
                self.hooks.dispatch(&record.code, &record.accesses);
                Ok(())
            }
            Err(e) => {
                trace!(%pc, error = %e, "step over failed, state restored");
                self.restore(saved);
                Err(e)
            }
        }
    }

    fn hook_code(&mut self, callback: CodeCallback) -> HookHandle {
        self.hooks.add_code(callback)
    }

    fn hook_memory_read(&mut self, callback: MemoryCallback) -> HookHandle {
        self.hooks.add_read(callback)
    }

    fn hook_memory_write(&mut self, callback: MemoryCallback) -> HookHandle {
        self.hooks.add_write(callback)
    }

    fn set_hooks_muted(&mut self, muted: bool) -> bool {
        self.hooks.set_muted(muted)
    }

    fn snapshot(&self) -> X86Snapshot {
        X86Snapshot {
            state: self.state.clone(),
            memory: self.memory.clone(),
        }
    }

    fn restore(&mut self, snapshot: X86Snapshot) {
        self.state = snapshot.state;
        self.memory = snapshot.memory;
    }

    fn steps_executed(&self) -> u64 {
        self.steps
    }
}

/// Execution of one instruction against a private copy of the registers.
struct Exec<'a> {
    memory: &'a EmulatorMemory,
    instr: &'a iced_x86::Instruction,
    arch: Architecture,
    pc: VirtualAddress,
    state: CpuState,
    writes: Vec<(VirtualAddress, Vec<u8>)>,
    accesses: Vec<MemoryAccess>,
}

type ExecResult<T> = Result<T, EmulatorError>;

impl<'a> Exec<'a> {
    fn word(&self) -> usize {
        self.arch.word_size() as usize
    }

    fn address_mask(&self) -> u64 {
        mask(self.word())
    }

    fn unsupported(&self) -> EmulatorError {
        EmulatorError::UnsupportedInstruction {
            pc: self.pc,
            mnemonic: format!("{:?}", self.instr.mnemonic()).to_ascii_lowercase(),
        }
    }

    fn reg(&self, reg: Register) -> ExecResult<RegRef> {
        RegRef::from_iced(reg).ok_or_else(|| self.unsupported())
    }

    fn read_mem(&mut self, address: u64, size: usize) -> ExecResult<u64> {
        let va = VirtualAddress(address & self.address_mask());
        let mut bytes = self
            .memory
            .read(va, size)
            .map_err(|_| EmulatorError::InvalidMemoryAccess {
                pc: self.pc,
                address: va,
                write: false,
            })?;
        // Writes buffered earlier in this instruction take precedence.
        for (start, data) in &self.writes {
            for (i, b) in data.iter().enumerate() {
                let a = start.value().wrapping_add(i as u64);
                if a >= va.value() && a - va.value() < size as u64 {
                    bytes[(a - va.value()) as usize] = *b;
                }
            }
        }
        let mut value = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            value |= (*b as u64) << (8 * i);
        }
        self.accesses.push(MemoryAccess {
            pc: self.pc,
            address: va,
            size,
            kind: AccessKind::Read,
            value,
        });
        Ok(value)
    }

    fn write_mem(&mut self, address: u64, size: usize, value: u64) -> ExecResult<()> {
        let va = VirtualAddress(address & self.address_mask());
        self.memory
            .check_writable(va, size)
            .map_err(|_| EmulatorError::InvalidMemoryAccess {
                pc: self.pc,
                address: va,
                write: true,
            })?;
        let value = value & mask(size);
        self.writes.push((va, value.to_le_bytes()[..size].to_vec()));
        self.accesses.push(MemoryAccess {
            pc: self.pc,
            address: va,
            size,
            kind: AccessKind::Write,
            value,
        });
        Ok(())
    }

    fn effective_address(&self) -> ExecResult<u64> {
        let i = self.instr;
        if matches!(i.memory_segment(), Register::FS | Register::GS) {
            return Err(self.unsupported());
        }
        let mut ea = i.memory_displacement64();
        let base = i.memory_base();
        if base != Register::None && !base.is_ip() {
            ea = ea.wrapping_add(self.state.read(self.reg(base)?));
        }
        let index = i.memory_index();
        if index != Register::None {
            let v = self.state.read(self.reg(index)?);
            ea = ea.wrapping_add(v.wrapping_mul(i.memory_index_scale() as u64));
        }
        Ok(ea & self.address_mask())
    }

    fn op_size(&self, op: u32) -> usize {
        match self.instr.op_kind(op) {
            OpKind::Register => self.instr.op_register(op).size(),
            OpKind::Memory => self.instr.memory_size().size(),
            OpKind::NearBranch16 => 2,
            OpKind::NearBranch32 | OpKind::NearBranch64 => self.word(),
            _ if op == 0 => self.word(),
            _ => self.op_size(0),
        }
    }

    fn read_op(&mut self, op: u32) -> ExecResult<u64> {
        let size = self.op_size(op);
        match self.instr.op_kind(op) {
            OpKind::Register => Ok(self.state.read(self.reg(self.instr.op_register(op))?)),
            OpKind::Memory => {
                let ea = self.effective_address()?;
                self.read_mem(ea, size)
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(self.instr.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(self.instr.immediate(op) & mask(size)),
            _ => Err(self.unsupported()),
        }
    }

    fn write_op(&mut self, op: u32, value: u64) -> ExecResult<()> {
        match self.instr.op_kind(op) {
            OpKind::Register => {
                let r = self.reg(self.instr.op_register(op))?;
                self.state.write(r, value);
                Ok(())
            }
            OpKind::Memory => {
                let ea = self.effective_address()?;
                let size = self.op_size(op);
                self.write_mem(ea, size, value)
            }
            _ => Err(self.unsupported()),
        }
    }

    fn sp(&self) -> u64 {
        self.state.gpr[RSP] & self.address_mask()
    }

    fn set_sp(&mut self, value: u64) {
        self.state.gpr[RSP] = value & self.address_mask();
    }

    fn push(&mut self, value: u64, size: usize) -> ExecResult<()> {
        let sp = self.sp().wrapping_sub(size as u64);
        self.write_mem(sp, size, value)?;
        self.set_sp(sp);
        Ok(())
    }

    fn pop(&mut self, size: usize) -> ExecResult<u64> {
        let sp = self.sp();
        let value = self.read_mem(sp, size)?;
        self.set_sp(sp.wrapping_add(size as u64));
        Ok(value)
    }

    /// Move the instruction pointer, faulting unless the target is executable.
    fn transfer(&mut self, target: u64) -> ExecResult<()> {
        let target = target & self.address_mask();
        match self.memory.permissions(VirtualAddress(target)) {
            Some(p) if p.contains(Permissions::X) => {
                self.state.ip = target;
                Ok(())
            }
            _ => Err(EmulatorError::InvalidFetch {
                pc: self.pc,
                address: VirtualAddress(target),
            }),
        }
    }

    fn branch_target(&mut self) -> ExecResult<u64> {
        match self.instr.op_kind(0) {
            OpKind::Register | OpKind::Memory => self.read_op(0),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(self.instr.near_branch_target())
            }
            _ => Err(self.unsupported()),
        }
    }

    fn run(&mut self) -> ExecResult<()> {
        let instr = self.instr;
        self.state.ip = instr.next_ip() & self.address_mask();

        if instr.is_jcc_short_or_near() {
            if self.state.flags.condition(instr.condition_code()) {
                self.transfer(instr.near_branch_target())?;
            }
            return Ok(());
        }
        if matches!(
            instr.mnemonic(),
            Mnemonic::Seta | Mnemonic::Setae | Mnemonic::Setb | Mnemonic::Setbe | Mnemonic::Sete
                | Mnemonic::Setg | Mnemonic::Setge | Mnemonic::Setl | Mnemonic::Setle | Mnemonic::Setne
                | Mnemonic::Setno | Mnemonic::Setnp | Mnemonic::Setns | Mnemonic::Seto | Mnemonic::Setp
                | Mnemonic::Sets
        ) {
            let taken = self.state.flags.condition(instr.condition_code());
            return self.write_op(0, taken as u64);
        }
        if matches!(
            instr.mnemonic(),
            Mnemonic::Cmova | Mnemonic::Cmovae | Mnemonic::Cmovb | Mnemonic::Cmovbe | Mnemonic::Cmove
                | Mnemonic::Cmovg | Mnemonic::Cmovge | Mnemonic::Cmovl | Mnemonic::Cmovle | Mnemonic::Cmovne
                | Mnemonic::Cmovno | Mnemonic::Cmovnp | Mnemonic::Cmovns | Mnemonic::Cmovo | Mnemonic::Cmovp
                | Mnemonic::Cmovs
        ) {
            let src = self.read_op(1)?;
            let value = if self.state.flags.condition(instr.condition_code()) {
                src
            } else {
                self.read_op(0)?
            };
            return self.write_op(0, value);
        }
        if instr.is_loop() || instr.is_loopcc() {
            let counter = RegRef {
                index: RCX,
                size: self.word(),
                high_byte: false,
            };
            let remaining = self.state.read(counter).wrapping_sub(1) & mask(counter.size);
            self.state.write(counter, remaining);
            let taken = remaining != 0
                && match instr.mnemonic() {
                    Mnemonic::Loope => self.state.flags.zf,
                    Mnemonic::Loopne => !self.state.flags.zf,
                    _ => true,
                };
            if taken {
                self.transfer(instr.near_branch_target())?;
            }
            return Ok(());
        }
        if instr.is_jcx_short() {
            let size = match instr.mnemonic() {
                Mnemonic::Jcxz => 2,
                Mnemonic::Jecxz => 4,
                _ => 8,
            };
            let counter = RegRef {
                index: RCX,
                size,
                high_byte: false,
            };
            if self.state.read(counter) == 0 {
                self.transfer(instr.near_branch_target())?;
            }
            return Ok(());
        }

        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Endbr32 | Mnemonic::Endbr64 | Mnemonic::Pause => Ok(()),
            Mnemonic::Int3
            | Mnemonic::Int
            | Mnemonic::Int1
            | Mnemonic::Into
            | Mnemonic::Hlt
            | Mnemonic::Syscall
            | Mnemonic::Sysenter
            | Mnemonic::Ud0
            | Mnemonic::Ud1
            | Mnemonic::Ud2 => Err(EmulatorError::Interrupt {
                pc: self.pc,
                mnemonic: format!("{:?}", instr.mnemonic()).to_ascii_lowercase(),
            }),

            Mnemonic::Mov | Mnemonic::Movzx => {
                let v = self.read_op(1)?;
                self.write_op(0, v)
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let v = sign_extend(self.read_op(1)?, self.op_size(1));
                self.write_op(0, v)
            }
            Mnemonic::Lea => {
                let ea = self.effective_address()?;
                self.write_op(0, ea)
            }
            Mnemonic::Xchg => {
                let a = self.read_op(0)?;
                let b = self.read_op(1)?;
                self.write_op(0, b)?;
                self.write_op(1, a)
            }
            Mnemonic::Push => {
                let size = self.op_size(0);
                let v = self.read_op(0)?;
                self.push(v, size)
            }
            Mnemonic::Pop => {
                let size = self.op_size(0);
                let v = self.pop(size)?;
                self.write_op(0, v)
            }
            Mnemonic::Leave => {
                let bp = self.state.gpr[RBP];
                self.set_sp(bp);
                let word = self.word();
                let v = self.pop(word)?;
                self.state.write(
                    RegRef {
                        index: RBP,
                        size: word,
                        high_byte: false,
                    },
                    v,
                );
                Ok(())
            }

            Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::Sub
            | Mnemonic::Sbb
            | Mnemonic::Cmp
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Test => self.binary_op(),
            Mnemonic::Inc | Mnemonic::Dec => {
                let size = self.op_size(0);
                let a = self.read_op(0)?;
                let r = self
                    .state
                    .flags
                    .update_inc_dec(a, instr.mnemonic() == Mnemonic::Inc, size);
                self.write_op(0, r)
            }
            Mnemonic::Neg => {
                let size = self.op_size(0);
                let a = self.read_op(0)?;
                let r = self.state.flags.update_sub(0, a, false, size);
                self.state.flags.cf = a & mask(size) != 0;
                self.write_op(0, r)
            }
            Mnemonic::Not => {
                let a = self.read_op(0)?;
                self.write_op(0, !a)
            }
            Mnemonic::Shl
            | Mnemonic::Sal
            | Mnemonic::Shr
            | Mnemonic::Sar
            | Mnemonic::Rol
            | Mnemonic::Ror => self.shift(),
            Mnemonic::Imul if instr.op_count() > 1 => self.imul_truncating(),
            Mnemonic::Mul | Mnemonic::Imul => self.widening_multiply(instr.mnemonic() == Mnemonic::Imul),
            Mnemonic::Div | Mnemonic::Idiv => self.divide(instr.mnemonic() == Mnemonic::Idiv),
            Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => {
                let size = match instr.mnemonic() {
                    Mnemonic::Cbw => 2,
                    Mnemonic::Cwde => 4,
                    _ => 8,
                };
                let r = RegRef {
                    index: RAX,
                    size,
                    high_byte: false,
                };
                let v = sign_extend(self.state.read(r), size / 2);
                self.state.write(r, v);
                Ok(())
            }
            Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => {
                let size = match instr.mnemonic() {
                    Mnemonic::Cwd => 2,
                    Mnemonic::Cdq => 4,
                    _ => 8,
                };
                let a = RegRef {
                    index: RAX,
                    size,
                    high_byte: false,
                };
                let d = RegRef {
                    index: RDX,
                    size,
                    high_byte: false,
                };
                let negative = (self.state.read(a) >> (size * 8 - 1)) & 1 == 1;
                self.state.write(d, if negative { u64::MAX } else { 0 });
                Ok(())
            }
            Mnemonic::Clc => {
                self.state.flags.cf = false;
                Ok(())
            }
            Mnemonic::Stc => {
                self.state.flags.cf = true;
                Ok(())
            }
            Mnemonic::Cmc => {
                self.state.flags.cf = !self.state.flags.cf;
                Ok(())
            }
            Mnemonic::Cld => {
                self.state.flags.df = false;
                Ok(())
            }
            Mnemonic::Std => {
                self.state.flags.df = true;
                Ok(())
            }

            Mnemonic::Call => {
                let target = self.branch_target()?;
                let word = self.word();
                let return_to = self.state.ip;
                self.push(return_to, word)?;
                self.transfer(target)
            }
            Mnemonic::Jmp => {
                let target = self.branch_target()?;
                self.transfer(target)
            }
            Mnemonic::Ret => {
                let word = self.word();
                let target = self.pop(word)?;
                if instr.op_count() == 1 {
                    let extra = instr.immediate16() as u64;
                    let sp = self.sp().wrapping_add(extra);
                    self.set_sp(sp);
                }
                self.transfer(target)
            }
            Mnemonic::Iret | Mnemonic::Iretd | Mnemonic::Iretq => {
                let word = self.word();
                let target = self.pop(word)?;
                let _cs = self.pop(word)?;
                let _flags = self.pop(word)?;
                if self.arch.is_64_bit() {
                    let sp = self.pop(word)?;
                    let _ss = self.pop(word)?;
                    self.set_sp(sp);
                }
                self.transfer(target)
            }
            _ => Err(self.unsupported()),
        }
    }

    fn binary_op(&mut self) -> ExecResult<()> {
        let m = self.instr.mnemonic();
        let size = self.op_size(0);
        let a = self.read_op(0)?;
        let b = self.read_op(1)?;
        let carry = self.state.flags.cf;
        let flags = &mut self.state.flags;
        let r = match m {
            Mnemonic::Add => flags.update_add(a, b, false, size),
            Mnemonic::Adc => flags.update_add(a, b, carry, size),
            Mnemonic::Sub | Mnemonic::Cmp => flags.update_sub(a, b, false, size),
            Mnemonic::Sbb => flags.update_sub(a, b, carry, size),
            Mnemonic::And | Mnemonic::Test => flags.update_logic(a & b, size),
            Mnemonic::Or => flags.update_logic(a | b, size),
            _ => flags.update_logic(a ^ b, size),
        };
        if matches!(m, Mnemonic::Cmp | Mnemonic::Test) {
            return Ok(());
        }
        self.write_op(0, r)
    }

    fn shift(&mut self) -> ExecResult<()> {
        let m = self.instr.mnemonic();
        let size = self.op_size(0);
        let bits = (size * 8) as u64;
        let raw = if self.instr.op_count() > 1 { self.read_op(1)? } else { 1 };
        let count = raw & if size == 8 { 0x3f } else { 0x1f };
        if count == 0 {
            return Ok(());
        }
        let a = self.read_op(0)? & mask(size);
        let msb = |v: u64| (v >> (bits - 1)) & 1 == 1;
        let flags = &mut self.state.flags;
        let r = match m {
            Mnemonic::Shl | Mnemonic::Sal => {
                let r = flags.update_logic(a.checked_shl(count as u32).unwrap_or(0), size);
                flags.cf = count <= bits && (a >> (bits - count)) & 1 == 1;
                flags.of = msb(r) != flags.cf;
                r
            }
            Mnemonic::Shr => {
                let r = flags.update_logic(a.checked_shr(count as u32).unwrap_or(0), size);
                flags.cf = (a >> (count - 1).min(63)) & 1 == 1;
                flags.of = msb(a);
                r
            }
            Mnemonic::Sar => {
                let signed = sign_extend(a, size) as i64;
                let r = flags.update_logic((signed >> count.min(63)) as u64, size);
                flags.cf = (signed >> (count - 1).min(63)) & 1 == 1;
                r
            }
            Mnemonic::Rol => {
                let n = count % bits;
                let r = ((a << n) | a.checked_shr((bits - n) as u32).unwrap_or(0)) & mask(size);
                let r = if n == 0 { a } else { r };
                flags.cf = r & 1 == 1;
                r
            }
            _ => {
                let n = count % bits;
                let r = ((a >> n) | a.checked_shl((bits - n) as u32).unwrap_or(0)) & mask(size);
                let r = if n == 0 { a } else { r };
                flags.cf = msb(r);
                r
            }
        };
        self.write_op(0, r)
    }

    /// Two- and three-operand imul.
    fn imul_truncating(&mut self) -> ExecResult<()> {
        let size = self.op_size(0);
        let (a, b) = if self.instr.op_count() == 3 {
            (self.read_op(1)?, self.read_op(2)?)
        } else {
            (self.read_op(0)?, self.read_op(1)?)
        };
        let wide = sign_extend(a, size) as i64 as i128 * sign_extend(b, size) as i64 as i128;
        let r = (wide as u64) & mask(size);
        let overflow = sign_extend(r, size) as i64 as i128 != wide;
        self.state.flags.cf = overflow;
        self.state.flags.of = overflow;
        self.write_op(0, r)
    }

    /// One-operand mul/imul into the accumulator pair.
    fn widening_multiply(&mut self, signed: bool) -> ExecResult<()> {
        let size = self.op_size(0);
        let b = self.read_op(0)?;
        let acc = RegRef {
            index: RAX,
            size,
            high_byte: false,
        };
        let a = self.state.read(acc);
        let bits = size * 8;
        let wide: u128 = if signed {
            (sign_extend(a, size) as i64 as i128 * sign_extend(b, size) as i64 as i128) as u128
        } else {
            a as u128 * b as u128
        };
        let lo = (wide as u64) & mask(size);
        let hi = ((wide >> bits) as u64) & mask(size);
        let overflow = if signed {
            (sign_extend(lo, size) as i64 as i128) != wide as i128
        } else {
            hi != 0
        };
        if size == 1 {
            self.state.write(
                RegRef {
                    index: RAX,
                    size: 2,
                    high_byte: false,
                },
                (hi << 8) | lo,
            );
        } else {
            self.state.write(acc, lo);
            self.state.write(
                RegRef {
                    index: RDX,
                    size,
                    high_byte: false,
                },
                hi,
            );
        }
        self.state.flags.cf = overflow;
        self.state.flags.of = overflow;
        Ok(())
    }

    fn divide(&mut self, signed: bool) -> ExecResult<()> {
        let size = self.op_size(0);
        let bits = size * 8;
        let divisor = self.read_op(0)?;
        if divisor & mask(size) == 0 {
            return Err(EmulatorError::DivideError { pc: self.pc });
        }
        let (lo_reg, hi_reg) = if size == 1 {
            (
                RegRef {
                    index: RAX,
                    size: 1,
                    high_byte: false,
                },
                RegRef {
                    index: RAX,
                    size: 1,
                    high_byte: true,
                },
            )
        } else {
            (
                RegRef {
                    index: RAX,
                    size,
                    high_byte: false,
                },
                RegRef {
                    index: RDX,
                    size,
                    high_byte: false,
                },
            )
        };
        let dividend = ((self.state.read(hi_reg) as u128) << bits) | self.state.read(lo_reg) as u128;

        let (q, r) = if signed {
            let shift = 128 - 2 * bits as u32;
            let n = ((dividend << shift) as i128) >> shift;
            let d = sign_extend(divisor, size) as i64 as i128;
            let q = n / d;
            let limit = 1i128 << (bits - 1);
            if q >= limit || q < -limit {
                return Err(EmulatorError::DivideError { pc: self.pc });
            }
            (q as u64, (n % d) as u64)
        } else {
            let d = (divisor & mask(size)) as u128;
            let q = dividend / d;
            if q > mask(size) as u128 {
                return Err(EmulatorError::DivideError { pc: self.pc });
            }
            (q as u64, (dividend % d) as u64)
        };
        self.state.write(lo_reg, q);
        self.state.write(hi_reg, r);
        Ok(())
    }
}

/// Creates stack-equipped [`X86Emulator`] instances over a shared image.
#[derive(Debug, Clone)]
pub struct X86EmulatorFactory {
    pub arch: Architecture,
    pub image: Arc<ImageAddressSpace>,
    pub stack: StackConfig,
    pub max_callee_steps: u64,
}

impl X86EmulatorFactory {
    pub fn new(arch: Architecture, image: Arc<ImageAddressSpace>) -> Self {
        Self {
            arch,
            image,
            stack: StackConfig::default(),
            max_callee_steps: DEFAULT_MAX_CALLEE_STEPS,
        }
    }

    pub fn with_stack(mut self, stack: StackConfig) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_max_callee_steps(mut self, max: u64) -> Self {
        self.max_callee_steps = max;
        self
    }
}

impl EmulatorFactory for X86EmulatorFactory {
    type Emulator = X86Emulator;

    fn create_emulator(&self) -> Result<X86Emulator, AnalysisError> {
        X86Emulator::with_stack(self.arch, self.image.clone(), &self.stack)
            .map(|emu| emu.with_max_callee_steps(self.max_callee_steps))
            .map_err(|e| AnalysisError::Resource(format!("cannot map emulator stack: {}", e)))
    }
}
