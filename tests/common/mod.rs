//! Common test utilities and helpers.
//!
//! Test programs are hand-assembled x86 byte sequences mapped as raw
//! shellcode at [`BASE`].

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use emuflow::core::symbol::SymbolTable;
use emuflow::emu::X86EmulatorFactory;
use emuflow::{Architecture, Engine, EngineConfig, EngineContext, LoadedModule, VirtualAddress};

/// Load address of every test program.
pub const BASE: u64 = 0x1000;

pub fn va(offset: u64) -> VirtualAddress {
    VirtualAddress(BASE + offset)
}

/// A `len`-byte zero buffer with each part copied to its offset.
pub fn assemble(len: usize, parts: &[(usize, &[u8])]) -> Vec<u8> {
    let mut code = vec![0u8; len];
    for (offset, bytes) in parts {
        code[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }
    code
}

pub fn shellcode(arch: Architecture, code: &[u8]) -> LoadedModule {
    LoadedModule::from_shellcode(code, arch, VirtualAddress(BASE)).expect("shellcode loads")
}

pub fn engine(code: &[u8]) -> Engine<X86EmulatorFactory> {
    shellcode(Architecture::X86, code).engine(EngineConfig::default())
}

pub fn engine_with(
    module: &LoadedModule,
    config: EngineConfig,
    symbols: SymbolTable,
) -> Engine<X86EmulatorFactory> {
    let context = EngineContext::new(Arc::new(module.decoder()))
        .with_symbols(Arc::new(symbols))
        .with_config(config);
    Engine::new(module.emulator_factory(&context.config), context)
}

/// Shared recorder for trace handlers.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn values(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

pub mod programs {
    /// `push 1; push 2; ret`
    pub const PUSH_TWO: &[u8] = &[0x6a, 0x01, 0x6a, 0x02, 0xc3];
    /// `pop eax; pop eax; ret`
    pub const POP_TWO: &[u8] = &[0x58, 0x58, 0xc3];
    /// `push ebp; mov ebp, esp; pop ebp; ret`
    pub const BALANCED: &[u8] = &[0x55, 0x89, 0xe5, 0x5d, 0xc3];
    /// `jmp $`
    pub const SPIN: &[u8] = &[0xeb, 0xfe];
    /// `call +3; xor eax, eax; ret` with the callee `push eax; pop eax; ret`
    /// at offset 8
    pub const CALL_LEAF: &[u8] = &[
        0xe8, 0x03, 0x00, 0x00, 0x00, // call 0x1008
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
        0x50, // push eax
        0x58, // pop eax
        0xc3, // ret
    ];
}
