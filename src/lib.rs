//! Emulation-assisted control-flow recovery for x86 and x86-64 programs.
//!
//! The engine discovers basic blocks and call/jump/memory cross-references
//! by driving a CPU emulator: indirect targets are resolved by probing inside
//! side-effect-free excursions, calls are stepped over, and every discovery
//! is delivered to an [`ArtifactCollection`] as it happens.
//!
//! ```no_run
//! use emuflow::{ArtifactLog, EngineConfig, LoadedModule};
//!
//! # fn main() -> emuflow::Result<()> {
//! let module = LoadedModule::from_path("sample.exe")?;
//! let engine = module.engine(EngineConfig::default());
//! let mut log = ArtifactLog::new();
//! let exploration = engine.explore_function(module.entry, &mut log)?;
//! println!("stack delta {}", exploration.stack_delta);
//! # Ok(())
//! # }
//! ```

/// Core data types module
pub mod core;

pub mod analysis;
pub mod config;
pub mod disasm;
pub mod emu;
pub mod error;
pub mod loader;
pub mod logging;
pub mod symbols;
pub mod timeout;

pub use analysis::{
    BlockOutcome, CallSite, Engine, EngineContext, FunctionExploration, Resolution, ResolutionMethod,
    StackCleanup, StackCleanupPolicy, TableCleanup, TargetResolver, ZeroCleanup,
};
pub use config::EngineConfig;
pub use crate::core::address::VirtualAddress;
pub use crate::core::artifact::{
    Artifact, ArtifactCollection, ArtifactLog, JsonLinesCollection, LoggingArtifactCollection,
};
pub use crate::core::disassembler::Architecture;
pub use emu::{Emulator, EmulatorFactory, ExcursionManager, X86Emulator};
pub use error::{AnalysisError, Result};
pub use loader::{LoadedModule, ModuleFormat};
