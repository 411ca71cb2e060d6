//! Call and jump target resolution.
//!
//! Direct transfers are read from the immediate operand. Transfers through a
//! memory slot registered as an import or export resolve to the slot itself.
//! Everything else is probed: one step into inside an excursion, reading the
//! instruction pointer it lands on. A landing site that is itself a
//! `jmp [mem]` thunk is followed, at most `max_indirection` times.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::address::VirtualAddress;
use crate::core::disassembler::{DecodeError, Decoder};
use crate::core::instruction::{Instruction, Operand};
use crate::core::symbol::{SymbolKind, SymbolResolver};
use crate::emu::state::mask;
use crate::emu::{Emulator, EmulatorError, ExcursionManager};
use crate::error::AnalysisError;

/// How a target was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Read from the immediate operand, no emulation
    Immediate,
    /// Memory slot known to the symbol resolver, no emulation
    Import,
    /// Probed by emulation inside an excursion
    Emulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub target: VirtualAddress,
    pub method: ResolutionMethod,
    /// Thunks followed after the initial landing
    pub hops: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("instruction at {at} is not a call or jump")]
    NotControlTransfer { at: VirtualAddress },

    #[error("probe from {at} faulted: {source}")]
    Faulted {
        at: VirtualAddress,
        #[source]
        source: EmulatorError,
    },

    #[error("more than {limit} thunks followed from {at}")]
    IndirectionLimit { at: VirtualAddress, limit: u32 },

    #[error("cannot decode transfer: {0}")]
    Decode(#[from] DecodeError),
}

impl ResolveError {
    /// Address of the transfer that could not be resolved, when known.
    pub fn address(&self) -> Option<VirtualAddress> {
        match self {
            ResolveError::NotControlTransfer { at }
            | ResolveError::Faulted { at, .. }
            | ResolveError::IndirectionLimit { at, .. } => Some(*at),
            ResolveError::Decode(DecodeError::InvalidInstruction(at)) => Some(*at),
            ResolveError::Decode(_) => None,
        }
    }
}

impl From<ResolveError> for AnalysisError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Decode(e) => AnalysisError::Decode(e),
            other => AnalysisError::CallTargetUnresolved {
                at: other.address().unwrap_or_default(),
                reason: other.to_string(),
            },
        }
    }
}

pub struct TargetResolver<'a> {
    decoder: &'a dyn Decoder,
    symbols: &'a dyn SymbolResolver,
    max_indirection: u32,
}

impl<'a> TargetResolver<'a> {
    pub fn new(decoder: &'a dyn Decoder, symbols: &'a dyn SymbolResolver, max_indirection: u32) -> Self {
        Self {
            decoder,
            symbols,
            max_indirection,
        }
    }

    /// Resolve the transfer at the emulator's instruction pointer.
    pub fn resolve<E: Emulator>(
        &self,
        emu: &mut E,
        excursions: &ExcursionManager,
    ) -> Result<Resolution, ResolveError> {
        let insn = self.decoder.decode(&*emu, emu.instruction_pointer())?;
        self.resolve_instruction(emu, excursions, &insn)
    }

    /// Resolve `insn`, which must be the instruction at the emulator's
    /// instruction pointer.
    pub fn resolve_instruction<E: Emulator>(
        &self,
        emu: &mut E,
        excursions: &ExcursionManager,
        insn: &Instruction,
    ) -> Result<Resolution, ResolveError> {
        if !(insn.is_call() || insn.is_jump()) {
            return Err(ResolveError::NotControlTransfer { at: insn.address });
        }
        match insn.operands.first() {
            Some(Operand::Immediate(value)) => {
                trace!(at = %insn.address, target = %VirtualAddress(*value), "immediate target");
                Ok(Resolution {
                    target: VirtualAddress(*value),
                    method: ResolutionMethod::Immediate,
                    hops: 0,
                })
            }
            Some(operand @ Operand::Memory { .. }) => {
                if let Some(slot) = self.known_slot(&*emu, operand) {
                    debug!(at = %insn.address, %slot, "import slot target");
                    return Ok(Resolution {
                        target: slot,
                        method: ResolutionMethod::Import,
                        hops: 0,
                    });
                }
                self.probe(emu, excursions, insn.address)
            }
            _ => self.probe(emu, excursions, insn.address),
        }
    }

    /// The slot address of a memory operand, if it names a known import or
    /// export.
    fn known_slot<E: Emulator>(&self, emu: &E, operand: &Operand) -> Option<VirtualAddress> {
        let slot = effective_address(emu, operand)?;
        let symbol = self.symbols.resolve_address_to_symbol(slot)?;
        matches!(symbol.kind, SymbolKind::Import | SymbolKind::Export).then_some(slot)
    }

    fn probe<E: Emulator>(
        &self,
        emu: &mut E,
        excursions: &ExcursionManager,
        at: VirtualAddress,
    ) -> Result<Resolution, ResolveError> {
        excursions.with_temporary_excursion(emu, |probe| {
            probe
                .step_into()
                .map_err(|source| ResolveError::Faulted { at, source })?;
            let mut hops = 0;
            loop {
                let landed = probe.instruction_pointer();
                let thunk = match self.decoder.decode(&*probe, landed) {
                    Ok(i) if is_thunk(&i) => i,
                    _ => {
                        debug!(%at, target = %landed, hops, "emulated target");
                        return Ok(Resolution {
                            target: landed,
                            method: ResolutionMethod::Emulated,
                            hops,
                        });
                    }
                };
                if let Some(slot) = self.known_slot(&*probe, &thunk.operands[0]) {
                    debug!(%at, thunk = %landed, %slot, "thunk through import slot");
                    return Ok(Resolution {
                        target: slot,
                        method: ResolutionMethod::Import,
                        hops,
                    });
                }
                if hops >= self.max_indirection {
                    debug!(%at, hops, "indirection limit reached");
                    return Err(ResolveError::IndirectionLimit {
                        at,
                        limit: self.max_indirection,
                    });
                }
                probe
                    .step_into()
                    .map_err(|source| ResolveError::Faulted { at, source })?;
                hops += 1;
            }
        })
    }
}

/// Unconditional `jmp [mem]`.
fn is_thunk(insn: &Instruction) -> bool {
    insn.is_jump()
        && !insn.is_conditional()
        && matches!(insn.operands.first(), Some(Operand::Memory { .. }))
}

/// Effective address of a memory operand under the emulator's registers.
pub fn effective_address<E: Emulator>(emu: &E, operand: &Operand) -> Option<VirtualAddress> {
    let Operand::Memory {
        base,
        index,
        scale,
        displacement,
    } = operand
    else {
        return None;
    };
    let mut ea = *displacement as u64;
    if let Some(base) = base {
        ea = ea.wrapping_add(emu.register_value(base).ok()?);
    }
    if let Some(index) = index {
        let v = emu.register_value(index).ok()?;
        ea = ea.wrapping_add(v.wrapping_mul(*scale as u64));
    }
    Some(VirtualAddress(ea & mask(emu.word_size() as usize)))
}
