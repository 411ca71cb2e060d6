//! Basic-block stepping.
//!
//! A block is handled in two passes. Reconnaissance decodes linearly from
//! the start, recording calls, until the first jump, return, or interrupt.
//! Execution then runs the emulator up to each call, resolves it, skips it
//! by moving the instruction pointer past it, applies the cleanup policy to
//! the stack pointer, and finally runs to the terminator, whose successors
//! are then read statically or resolved. A block cut short by the
//! instruction cap or an undecodable successor executes its last
//! instruction instead, unless that instruction is a skipped call.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::cleanup::StackCleanup;
use super::engine::Engine;
use super::resolver::ResolutionMethod;
use crate::core::address::VirtualAddress;
use crate::core::address_space::AddressSpace;
use crate::core::artifact::ArtifactCollection;
use crate::core::basic_block::BasicBlock;
use crate::core::disassembler::{DecodeError, Decoder};
use crate::core::instruction::{Instruction, InstructionGroups};
use crate::core::reference::{CallXref, JumpXref};
use crate::emu::{Emulator, EmulatorError, EmulatorFactory, ExcursionManager};
use crate::error::{AnalysisError, Result};
use crate::timeout::StepBudget;

/// A call skipped during block stepping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub address: VirtualAddress,
    pub target: Option<VirtualAddress>,
    pub method: Option<ResolutionMethod>,
    pub cleanup: StackCleanup,
}

/// Result of stepping one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOutcome {
    pub block: BasicBlock,
    /// Intra-function successors, taken target first
    pub successors: Vec<VirtualAddress>,
    pub call_sites: Vec<CallSite>,
    /// Transfers in this block whose target could not be resolved
    pub unresolved: Vec<VirtualAddress>,
    /// Emulator steps spent, probes included
    pub steps: u64,
}

/// Static shape of a block, before any emulation.
#[derive(Debug, Clone)]
pub(crate) struct BlockPlan {
    pub start: VirtualAddress,
    pub calls: Vec<Instruction>,
    /// Last decoded instruction: the terminator, or where the scan stopped
    pub last: Instruction,
    pub terminated: bool,
    /// Scan stopped by the instruction cap rather than a terminator
    pub capped: bool,
}

fn is_terminator(insn: &Instruction) -> bool {
    insn.is_jump() || insn.is_return() || insn.groups.contains(InstructionGroups::INTERRUPT)
}

/// Decode forward from `start` without touching any emulator.
///
/// An undecodable instruction after the first ends the scan.
pub(crate) fn plan_block(
    decoder: &dyn Decoder,
    space: &dyn AddressSpace,
    start: VirtualAddress,
    max_instructions: usize,
) -> std::result::Result<BlockPlan, DecodeError> {
    let mut calls = Vec::new();
    let mut last = decoder.decode(space, start)?;
    let mut count = 1;
    loop {
        if is_terminator(&last) {
            return Ok(BlockPlan {
                start,
                calls,
                last,
                terminated: true,
                capped: false,
            });
        }
        if last.is_call() {
            trace!(at = %last.address, "planning: found call");
            calls.push(last.clone());
        }
        if count >= max_instructions {
            return Ok(BlockPlan {
                start,
                calls,
                last,
                terminated: false,
                capped: true,
            });
        }
        match decoder.decode(space, last.next_address()) {
            Ok(next) => {
                last = next;
                count += 1;
            }
            Err(e) => {
                debug!(at = %last.next_address(), error = %e, "linear scan ended");
                return Ok(BlockPlan {
                    start,
                    calls,
                    last,
                    terminated: false,
                    capped: false,
                });
            }
        }
    }
}

impl<F: EmulatorFactory> Engine<F> {
    /// Step one basic block on a fresh emulator.
    ///
    /// `space` is the view used for reconnaissance; it is normally the
    /// program image. Call sites, the block and its edges go to `collector`
    /// as they are discovered.
    pub fn emulate_basic_block(
        &self,
        space: &dyn AddressSpace,
        start: VirtualAddress,
        collector: &mut dyn ArtifactCollection,
    ) -> Result<BlockOutcome> {
        let mut emu = self.create_emulator()?;
        self.emulate_basic_block_with(&mut emu, space, start, collector)
    }

    /// Step one basic block on a caller-owned emulator, keeping its
    /// register and memory state from earlier blocks.
    ///
    /// A block that ends without a terminator leaves the emulator at its
    /// fall-through, so the next block can be stepped on the same emulator.
    pub fn emulate_basic_block_with(
        &self,
        emu: &mut F::Emulator,
        space: &dyn AddressSpace,
        start: VirtualAddress,
        collector: &mut dyn ArtifactCollection,
    ) -> Result<BlockOutcome> {
        debug!(%start, "emulating basic block");
        let config = &self.context().config;
        let mut budget = StepBudget::from_config(&config.budget, "emulate_basic_block");
        let plan = plan_block(
            self.context().decoder.as_ref(),
            space,
            start,
            config.budget.max_block_instructions,
        )?;

        let resolver = self.resolver();
        let excursions = ExcursionManager::new();
        let _trace = self.install_instruction_trace(emu);
        let first_step = emu.steps_executed();
        let mut charged = first_step;
        let mut call_sites = Vec::with_capacity(plan.calls.len());
        let mut unresolved = Vec::new();

        emu.set_instruction_pointer(start);
        for call in &plan.calls {
            trace!(from = %emu.instruction_pointer(), to = %call.address, "emulating to call");
            run_to(emu, call.address, &mut budget, &mut charged)?;

            let resolution = resolver.resolve_instruction(emu, &excursions, call);
            charge(emu, &mut budget, &mut charged)?;
            let (target, method) = match resolution {
                Ok(r) => (Some(r.target), Some(r.method)),
                Err(e) => {
                    debug!(at = %call.address, error = %e, "call target unresolved");
                    unresolved.push(call.address);
                    (None, None)
                }
            };
            collector.add_call_xref(CallXref {
                from: call.address,
                to: target,
            })?;
            let cleanup = self.context().cleanup.cleanup(target);

            emu.set_instruction_pointer(call.next_address());
            let sp = emu.stack_pointer();
            emu.set_stack_pointer(sp.wrapping_offset(cleanup.bytes() as i64));
            debug!(at = %call.address, target = ?target, ?cleanup, "skipped call");
            call_sites.push(CallSite {
                address: call.address,
                target,
                method,
                cleanup,
            });
        }

        let last = &plan.last;
        let mut successors = Vec::with_capacity(2);
        if plan.terminated {
            trace!(from = %emu.instruction_pointer(), to = %last.address, "emulating to block end");
            run_to(emu, last.address, &mut budget, &mut charged)?;
            if last.is_jump() {
                match last.direct_target() {
                    Some(target) => successors.push(target),
                    None => match resolver.resolve_instruction(emu, &excursions, last) {
                        Ok(r) => successors.push(r.target),
                        Err(e) => {
                            debug!(at = %last.address, error = %e, "jump target unresolved");
                            unresolved.push(last.address);
                        }
                    },
                }
                charge(emu, &mut budget, &mut charged)?;
                if last.is_conditional() {
                    successors.push(last.next_address());
                }
            }
        } else {
            // Cut short: the last instruction still executes, unless it is a
            // call that was skipped above.
            if !last.is_call() {
                run_to(emu, last.address, &mut budget, &mut charged)?;
                let stepped = emu.step_into();
                charge(emu, &mut budget, &mut charged)?;
                stepped?;
            }
            if plan.capped {
                successors.push(last.next_address());
            }
        }

        let block = BasicBlock::new(start, last.address);
        collector.add_basic_block(block)?;
        for to in &successors {
            let xref = JumpXref {
                from: last.address,
                to: *to,
            };
            self.notify_jump(&xref);
            collector.add_jump_xref(xref)?;
        }

        debug!(%block, successors = successors.len(), "basic block done");
        Ok(BlockOutcome {
            block,
            successors,
            call_sites,
            unresolved,
            steps: emu.steps_executed() - first_step,
        })
    }
}

/// Charge the budget for every emulator step since the last charge.
fn charge<E: Emulator>(emu: &E, budget: &mut StepBudget, charged: &mut u64) -> Result<()> {
    let now = emu.steps_executed();
    let delta = now - *charged;
    *charged = now;
    budget.charge(delta)
}

fn run_to<E: Emulator>(
    emu: &mut E,
    target: VirtualAddress,
    budget: &mut StepBudget,
    charged: &mut u64,
) -> Result<()> {
    let outcome = emu.run_to(target, budget.remaining());
    charge(emu, budget, charged)?;
    match outcome {
        Ok(_) => Ok(()),
        Err(EmulatorError::StepLimitReached { .. }) => Err(budget.exhausted()),
        Err(e) => Err(AnalysisError::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address_space::{ImageAddressSpace, Permissions, Region};
    use crate::core::disassembler::Architecture;
    use crate::disasm::IcedDecoder;

    fn image(code: &[u8]) -> ImageAddressSpace {
        let mut img = ImageAddressSpace::new();
        img.map(Region::new("code", VirtualAddress(0x1000), code.len() as u64, code, Permissions::RX))
            .unwrap();
        img
    }

    #[test]
    fn test_plan_records_calls_until_terminator() {
        // call +0; nop; jne -9; nop
        let img = image(&[0xe8, 0, 0, 0, 0, 0x90, 0x75, 0xf7, 0x90]);
        let decoder = IcedDecoder::new(Architecture::X86);
        let plan = plan_block(&decoder, &img, VirtualAddress(0x1000), 16).unwrap();
        assert_eq!(plan.calls.len(), 1);
        assert_eq!(plan.last.address, VirtualAddress(0x1006));
        assert!(plan.terminated);
    }

    #[test]
    fn test_plan_cap_and_scan_end() {
        let img = image(&[0x90, 0x90, 0x90]);
        let decoder = IcedDecoder::new(Architecture::X86);
        let capped = plan_block(&decoder, &img, VirtualAddress(0x1000), 2).unwrap();
        assert!(capped.capped);
        assert_eq!(capped.last.address, VirtualAddress(0x1001));

        let ended = plan_block(&decoder, &img, VirtualAddress(0x1000), 16).unwrap();
        assert!(!ended.terminated && !ended.capped);
        assert_eq!(ended.last.address, VirtualAddress(0x1002));

        assert!(plan_block(&decoder, &img, VirtualAddress(0x2000), 16).is_err());
    }
}
