use iced_x86::{FlowControl, Mnemonic, OpKind, Register as IReg};

use crate::core::address::VirtualAddress;
use crate::core::disassembler::{Architecture, DecodeError, DecodeResult, Decoder};
use crate::core::instruction::{Instruction, InstructionGroups, Operand};

/// x86/x86-64 decoder backed by iced-x86.
#[derive(Debug, Clone, Copy)]
pub struct IcedDecoder {
    arch: Architecture,
}

impl IcedDecoder {
    pub fn new(arch: Architecture) -> Self {
        Self { arch }
    }

    /// Decode into the raw iced instruction; shared with the emulator.
    pub fn decode_raw(&self, address: VirtualAddress, bytes: &[u8]) -> DecodeResult<iced_x86::Instruction> {
        let mut decoder = iced_x86::Decoder::with_ip(
            self.arch.address_bits(),
            bytes,
            address.value(),
            iced_x86::DecoderOptions::NONE,
        );
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(DecodeError::InvalidInstruction(address));
        }
        Ok(instr)
    }

    /// Build the coarse instruction model from a decoded iced instruction.
    pub fn convert(instr: &iced_x86::Instruction, bytes: &[u8]) -> Instruction {
        let len = instr.len().min(bytes.len());
        Instruction::new(
            VirtualAddress(instr.ip()),
            bytes[..len].to_vec(),
            format!("{:?}", instr.mnemonic()).to_ascii_lowercase(),
            iced_operands(instr),
            classify(instr),
        )
    }
}

pub(crate) fn register_name(reg: IReg) -> String {
    format!("{:?}", reg).to_ascii_lowercase()
}

fn iced_operands(instr: &iced_x86::Instruction) -> Vec<Operand> {
    let mut out = Vec::with_capacity(instr.op_count() as usize);
    for i in 0..instr.op_count() {
        match instr.op_kind(i) {
            OpKind::Register => out.push(Operand::Register(register_name(instr.op_register(i)))),
            OpKind::Memory => {
                let base = instr.memory_base();
                let index = instr.memory_index();
                // RIP/EIP-relative: iced already folds the next-ip into the displacement.
                let base = if base == IReg::None || base.is_ip() {
                    None
                } else {
                    Some(register_name(base))
                };
                let index = (index != IReg::None).then(|| register_name(index));
                out.push(Operand::Memory {
                    base,
                    index,
                    scale: instr.memory_index_scale() as u8,
                    displacement: instr.memory_displacement64() as i64,
                });
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                out.push(Operand::Immediate(instr.near_branch_target()))
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => out.push(Operand::Immediate(instr.immediate(i))),
            // Far branches and string operands are not modeled.
            _ => {}
        }
    }
    out
}

fn classify(instr: &iced_x86::Instruction) -> InstructionGroups {
    if matches!(instr.mnemonic(), Mnemonic::Iret | Mnemonic::Iretd | Mnemonic::Iretq) {
        return InstructionGroups::INTERRUPT_RETURN;
    }
    match instr.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend => InstructionGroups::empty(),
        FlowControl::UnconditionalBranch => InstructionGroups::JUMP,
        FlowControl::IndirectBranch => InstructionGroups::JUMP | InstructionGroups::INDIRECT,
        FlowControl::ConditionalBranch => InstructionGroups::JUMP | InstructionGroups::CONDITIONAL,
        FlowControl::Return => InstructionGroups::RETURN,
        FlowControl::Call => InstructionGroups::CALL,
        FlowControl::IndirectCall => InstructionGroups::CALL | InstructionGroups::INDIRECT,
        FlowControl::Interrupt | FlowControl::Exception => InstructionGroups::INTERRUPT,
    }
}

impl Decoder for IcedDecoder {
    fn decode_bytes(&self, address: VirtualAddress, bytes: &[u8]) -> DecodeResult<Instruction> {
        let instr = self.decode_raw(address, bytes)?;
        Ok(Self::convert(&instr, bytes))
    }

    fn max_instruction_length(&self) -> usize {
        15
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn name(&self) -> &str {
        "iced-x86"
    }
}
