//! The emulation-assisted control-flow recovery engine.
//!
//! One `Engine` serves both granularities: [`Engine::emulate_basic_block`]
//! (block stepping, calls skipped by hand) and [`Engine::explore_function`]
//! (function walk, calls stepped over). Both share the target resolver, the
//! excursion discipline, and the registered trace handlers.

use std::sync::Arc;

use tracing::warn;

use super::cleanup::{StackCleanupPolicy, ZeroCleanup};
use super::resolver::TargetResolver;
use crate::config::EngineConfig;
use crate::core::disassembler::Decoder;
use crate::core::instruction::Instruction;
use crate::core::reference::JumpXref;
use crate::core::symbol::{SymbolResolver, SymbolTable};
use crate::emu::{Emulator, EmulatorFactory, HookHandle};
use crate::error::Result;

/// Receives every instruction executed on the authoritative path.
pub type InstructionTraceHandler = Arc<dyn Fn(&Instruction) + Send + Sync>;

/// Receives confirmed control-flow edges.
pub type JumpTraceHandler = Arc<dyn Fn(&JumpXref) + Send + Sync>;

/// Collaborators and settings shared by every exploration.
#[derive(Clone)]
pub struct EngineContext {
    pub decoder: Arc<dyn Decoder>,
    pub symbols: Arc<dyn SymbolResolver>,
    pub cleanup: Arc<dyn StackCleanupPolicy>,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Context with an empty symbol table, no stack cleanup knowledge, and
    /// the default configuration.
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self {
            decoder,
            symbols: Arc::new(SymbolTable::new()),
            cleanup: Arc::new(ZeroCleanup),
            config: EngineConfig::default(),
        }
    }

    pub fn with_symbols(mut self, symbols: Arc<dyn SymbolResolver>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn StackCleanupPolicy>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("decoder", &self.decoder.name())
            .field("architecture", &self.decoder.architecture())
            .field("config", &self.config)
            .finish()
    }
}

pub struct Engine<F: EmulatorFactory> {
    factory: F,
    context: EngineContext,
    instruction_handlers: Vec<InstructionTraceHandler>,
    jump_handlers: Vec<JumpTraceHandler>,
}

impl<F: EmulatorFactory> Engine<F> {
    pub fn new(factory: F, context: EngineContext) -> Self {
        Self {
            factory,
            context,
            instruction_handlers: Vec::new(),
            jump_handlers: Vec::new(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Append a handler for executed instructions. Handlers run
    /// synchronously, in execution order, after each committed step.
    pub fn register_instruction_trace_handler<H>(&mut self, handler: H)
    where
        H: Fn(&Instruction) + Send + Sync + 'static,
    {
        self.instruction_handlers.push(Arc::new(handler));
    }

    /// Append a handler for control-flow edges.
    pub fn register_jump_trace_handler<H>(&mut self, handler: H)
    where
        H: Fn(&JumpXref) + Send + Sync + 'static,
    {
        self.jump_handlers.push(Arc::new(handler));
    }

    /// A fresh emulator for one unit of work.
    pub fn create_emulator(&self) -> Result<F::Emulator> {
        self.factory.create_emulator()
    }

    pub(crate) fn resolver(&self) -> TargetResolver<'_> {
        TargetResolver::new(
            self.context.decoder.as_ref(),
            self.context.symbols.as_ref(),
            self.context.config.resolver.max_indirection,
        )
    }

    /// Wire the instruction trace handlers to the emulator's code hook.
    ///
    /// Handlers see the instruction re-decoded from the executed bytes.
    pub(crate) fn install_instruction_trace<E: Emulator>(&self, emu: &mut E) -> Option<HookHandle> {
        if self.instruction_handlers.is_empty() {
            return None;
        }
        let handlers = self.instruction_handlers.clone();
        let decoder = self.context.decoder.clone();
        Some(emu.hook_code(Box::new(move |event| {
            match decoder.decode_bytes(event.address, &event.bytes) {
                Ok(insn) => {
                    for handler in &handlers {
                        handler(&insn);
                    }
                }
                Err(e) => warn!(
                    address = %event.address,
                    bytes = %hex::encode(&event.bytes),
                    error = %e,
                    "cannot re-decode traced instruction"
                ),
            }
        })))
    }

    pub(crate) fn notify_jump(&self, xref: &JumpXref) {
        for handler in &self.jump_handlers {
            handler(xref);
        }
    }
}

impl<F: EmulatorFactory + std::fmt::Debug> std::fmt::Debug for Engine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("factory", &self.factory)
            .field("context", &self.context)
            .field("instruction_handlers", &self.instruction_handlers.len())
            .field("jump_handlers", &self.jump_handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::VirtualAddress;
    use crate::core::address_space::{ImageAddressSpace, Permissions, Region};
    use crate::core::disassembler::Architecture;
    use crate::disasm::IcedDecoder;
    use crate::emu::x86::X86EmulatorFactory;
    use std::sync::Mutex;

    #[test]
    fn test_trace_handlers_receive_decoded_instructions() {
        let mut img = ImageAddressSpace::new();
        // nop; inc eax
        img.map(Region::new("code", VirtualAddress(0x1000), 0x10, &[0x90, 0x40], Permissions::RX))
            .unwrap();
        let factory = X86EmulatorFactory::new(Architecture::X86, Arc::new(img));
        let context = EngineContext::new(Arc::new(IcedDecoder::new(Architecture::X86)));
        let mut engine = Engine::new(factory, context);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        engine.register_instruction_trace_handler(move |insn| {
            s.lock().unwrap().push(insn.mnemonic.clone());
        });

        let mut emu = engine.create_emulator().unwrap();
        let _hook = engine.install_instruction_trace(&mut emu);
        emu.set_instruction_pointer(VirtualAddress(0x1000));
        emu.step_into().unwrap();
        emu.step_into().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["nop", "inc"]);
    }
}
