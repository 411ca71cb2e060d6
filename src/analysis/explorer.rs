//! Function-level exploration.
//!
//! One step-over walk from the entry address. The walk runs until it reaches
//! a return (returned) or an authoritative step fails (faulted); a faulted
//! walk emits nothing further and surfaces its error.
//!
//! Calls are probed for their target inside an excursion and then stepped
//! over, so the walk never records anything inside a callee. Memory accesses
//! observed on the authoritative path become read/write cross-references.

use std::cell::RefCell;
use std::rc::Rc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::Engine;
use crate::core::address::VirtualAddress;
use crate::core::artifact::{Artifact, ArtifactCollection, ArtifactLog};
use crate::core::basic_block::BasicBlock;
use crate::core::reference::{CallXref, JumpXref, MemoryReadXref, MemoryWriteXref};
use crate::emu::{AccessKind, Emulator, EmulatorFactory, ExcursionManager, HookHandle};
use crate::error::{AnalysisError, Result};
use crate::{log_error, span_trace};
use crate::timeout::StepBudget;

/// Summary of a walk that reached a return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionExploration {
    pub entry: VirtualAddress,
    /// Address of the return instruction that ended the walk
    pub return_address: VirtualAddress,
    /// Stack pointer at the return minus stack pointer at entry
    pub stack_delta: i64,
    pub blocks: Vec<BasicBlock>,
    /// Emulator steps spent, callees and probes included
    pub steps: u64,
}

impl FunctionExploration {
    /// Stack delta in words: negative when the function left data pushed.
    pub fn stack_delta_words(&self, word_size: u64) -> i64 {
        self.stack_delta / word_size as i64
    }
}

/// Buffers memory events of the current step until it commits.
type PendingAccesses = Rc<RefCell<Vec<Artifact>>>;

fn install_access_hooks<E: Emulator>(emu: &mut E, pending: &PendingAccesses) -> [HookHandle; 2] {
    let reads = pending.clone();
    let read = emu.hook_memory_read(Box::new(move |access| {
        debug_assert_eq!(access.kind, AccessKind::Read);
        reads.borrow_mut().push(
            MemoryReadXref {
                from: access.pc,
                to: access.address,
            }
            .into(),
        );
    }));
    let writes = pending.clone();
    let write = emu.hook_memory_write(Box::new(move |access| {
        writes.borrow_mut().push(
            MemoryWriteXref {
                from: access.pc,
                to: access.address,
            }
            .into(),
        );
    }));
    [read, write]
}

impl<F: EmulatorFactory> Engine<F> {
    /// Walk the function at `entry` on a fresh emulator, delivering
    /// artifacts to `collector` in discovery order.
    pub fn explore_function(
        &self,
        entry: VirtualAddress,
        collector: &mut dyn ArtifactCollection,
    ) -> Result<FunctionExploration> {
        let mut emu = self.create_emulator()?;
        self.explore_function_with(&mut emu, entry, collector)
    }

    /// Walk the function at `entry` on a caller-provided emulator.
    pub fn explore_function_with(
        &self,
        emu: &mut F::Emulator,
        entry: VirtualAddress,
        collector: &mut dyn ArtifactCollection,
    ) -> Result<FunctionExploration> {
        let _span = span_trace!("explore_function", entry = %entry).entered();
        let config = &self.context().config;
        let decoder = self.context().decoder.as_ref();
        let resolver = self.resolver();
        let excursions = ExcursionManager::new();
        let mut budget = StepBudget::from_config(&config.budget, "explore_function");

        let pending: PendingAccesses = Rc::new(RefCell::new(Vec::new()));
        let _access_hooks = config
            .trace_memory_accesses
            .then(|| install_access_hooks(emu, &pending));
        let _trace = self.install_instruction_trace(emu);

        emu.set_instruction_pointer(entry);
        let entry_sp = emu.stack_pointer();
        let first_step = emu.steps_executed();
        let mut charged = first_step;
        let mut block_start = entry;
        let mut blocks = Vec::new();

        // Faulted: events of the failed step are dropped, nothing further is emitted.
        let fault = |err: AnalysisError| {
            pending.borrow_mut().clear();
            log_error!(err, "exploration faulted")
        };

        loop {
            let pc = emu.instruction_pointer();
            let insn = match decoder.decode(&*emu, pc) {
                Ok(i) => i,
                Err(e) => return Err(fault(e.into())),
            };

            if insn.is_call() {
                let target = match resolver.resolve_instruction(emu, &excursions, &insn) {
                    Ok(r) => Some(r.target),
                    Err(e) => {
                        debug!(at = %pc, error = %e, "call target unresolved");
                        None
                    }
                };
                collector.add_call_xref(CallXref { from: pc, to: target })?;
            }

            if insn.is_return() {
                let stack_delta = emu.stack_pointer().signed_distance_from(entry_sp);
                let block = BasicBlock::new(block_start, pc);
                collector.add_basic_block(block)?;
                blocks.push(block);
                info!(%entry, return_address = %pc, stack_delta, "function returned");
                return Ok(FunctionExploration {
                    entry,
                    return_address: pc,
                    stack_delta,
                    blocks,
                    steps: emu.steps_executed() - first_step,
                });
            }

            let ends_block = insn.is_block_end();
            if ends_block {
                let block = BasicBlock::new(block_start, pc);
                collector.add_basic_block(block)?;
                blocks.push(block);
            }

            if let Err(e) = emu.step_over() {
                return Err(fault(e.into()));
            }
            let now = emu.steps_executed();
            if let Err(e) = budget.charge(now - charged) {
                return Err(fault(e));
            }
            charged = now;

            let accesses: Vec<Artifact> = pending.borrow_mut().drain(..).collect();
            for artifact in accesses {
                collector.record(artifact)?;
            }

            if ends_block {
                let after = emu.instruction_pointer();
                block_start = after;
                let xref = JumpXref { from: pc, to: after };
                self.notify_jump(&xref);
                collector.add_jump_xref(xref)?;
            }
        }
    }

    /// Explore many functions in parallel, each on its own emulator and
    /// artifact log. Results come back in `entries` order.
    pub fn explore_functions(
        &self,
        entries: &[VirtualAddress],
    ) -> Vec<(VirtualAddress, Result<(FunctionExploration, ArtifactLog)>)> {
        entries
            .par_iter()
            .map(|&entry| {
                let mut log = ArtifactLog::new();
                let result = self
                    .explore_function(entry, &mut log)
                    .map(|exploration| (exploration, log));
                (entry, result)
            })
            .collect()
    }
}
