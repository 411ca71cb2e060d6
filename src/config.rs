//! Configuration for the analysis engine.
//!
//! Provides centralized configuration for budgets, the target resolver, and
//! the emulator stack with sensible defaults. Every group is
//! `#[serde(default)]`, so a JSON document only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AnalysisError, Result};

/// Master configuration for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Step and time limits for each entry point.
    pub budget: BudgetConfig,
    /// Indirect target resolution.
    pub resolver: ResolverConfig,
    /// Emulated stack placement.
    pub stack: StackConfig,
    /// Emit memory read/write cross-references during function walks.
    pub trace_memory_accesses: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            resolver: ResolverConfig::default(),
            stack: StackConfig::default(),
            trace_memory_accesses: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations the emulator cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.budget.max_steps == 0 {
            return Err(AnalysisError::Config("budget.max_steps must be positive".into()));
        }
        if self.budget.max_block_instructions == 0 {
            return Err(AnalysisError::Config(
                "budget.max_block_instructions must be positive".into(),
            ));
        }
        if self.stack.size == 0 || self.stack.headroom >= self.stack.size {
            return Err(AnalysisError::Config(format!(
                "stack headroom {:#x} must be smaller than stack size {:#x}",
                self.stack.headroom, self.stack.size
            )));
        }
        if self.stack.base.checked_add(self.stack.size).is_none() {
            return Err(AnalysisError::Config("stack region wraps the address space".into()));
        }
        Ok(())
    }
}

/// Execution limits. Exhausting any of them ends the unit of work with
/// `BudgetExceeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum emulated instructions per entry point call
    pub max_steps: u64,
    /// Wall-clock limit in milliseconds (0 disables)
    pub max_duration_ms: u64,
    /// Maximum instructions scanned during block reconnaissance
    pub max_block_instructions: usize,
    /// Maximum instructions a stepped-over callee may execute
    pub max_callee_steps: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_duration_ms: 30_000,
            max_block_instructions: 4096,
            max_callee_steps: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Import-slot or trampoline hops followed before failing closed
    pub max_indirection: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_indirection: 1 }
    }
}

/// Placement of the emulated stack. The initial stack pointer sits
/// `headroom` bytes below the top so that a function popping more than it
/// pushed still reads mapped memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub base: u64,
    pub size: u64,
    pub headroom: u64,
}

impl StackConfig {
    /// Stack pointer value at the start of every run.
    pub fn initial_pointer(&self) -> u64 {
        self.base + self.size - self.headroom
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            base: 0x7f00_0000,
            size: 0x10_0000,
            headroom: 0x1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.resolver.max_indirection, 1);
        assert_eq!(config.stack.initial_pointer(), 0x7f0f_f000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"budget": {"max_steps": 50}}"#).unwrap();
        assert_eq!(config.budget.max_steps, 50);
        assert_eq!(config.budget.max_callee_steps, 100_000);
        assert_eq!(config.stack, StackConfig::default());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));

        let err = EngineConfig::from_json(r#"{"stack": {"size": 16, "headroom": 32}}"#).unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn test_from_path_roundtrip() {
        let mut config = EngineConfig::default();
        config.budget.max_steps = 1234;
        config.trace_memory_accesses = false;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();

        let loaded = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_path("/nonexistent/emuflow.json").unwrap_err();
        assert!(matches!(err, AnalysisError::Io(_)));
        assert!(!err.is_recoverable());
    }
}
