//! Emulation-assisted control-flow recovery.
//!
//! The [`engine::Engine`] drives an emulator over one basic block
//! ([`stepper`]) or one function ([`explorer`]), resolving indirect transfers
//! with the [`resolver`] and compensating skipped calls with a
//! [`cleanup`] policy.

pub mod cleanup;
pub mod engine;
pub mod explorer;
pub mod resolver;
pub mod stepper;

pub use cleanup::{StackCleanup, StackCleanupPolicy, TableCleanup, ZeroCleanup};
pub use engine::{Engine, EngineContext, InstructionTraceHandler, JumpTraceHandler};
pub use explorer::FunctionExploration;
pub use resolver::{Resolution, ResolutionMethod, ResolveError, TargetResolver};
pub use stepper::{BlockOutcome, CallSite};
