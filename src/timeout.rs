//! Step and wall-clock budgets for emulation loops.
//!
//! Every engine entry point creates one `StepBudget` and charges it for each
//! emulated instruction. The wall clock is only sampled every
//! `check_interval` charges to keep the hot loop cheap.

use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::config::BudgetConfig;
use crate::error::{AnalysisError, Result};

/// Default wall-clock check interval, in charged steps
pub const DEFAULT_CHECK_INTERVAL: u64 = 256;

/// Step counter plus an optional deadline.
#[derive(Debug, Clone)]
pub struct StepBudget {
    start: Instant,
    max_steps: u64,
    max_duration: Option<Duration>,
    check_interval: u64,
    used: u64,
    operation_name: String,
}

impl StepBudget {
    /// Create a budget of `max_steps` with an optional deadline.
    pub fn new(max_steps: u64, max_duration: Option<Duration>, operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            max_steps,
            max_duration,
            check_interval: DEFAULT_CHECK_INTERVAL,
            used: 0,
            operation_name: operation.into(),
        }
    }

    /// Build from configuration; a zero duration disables the deadline.
    pub fn from_config(config: &BudgetConfig, operation: impl Into<String>) -> Self {
        let deadline = (config.max_duration_ms > 0).then(|| Duration::from_millis(config.max_duration_ms));
        Self::new(config.max_steps, deadline, operation)
    }

    /// Set the check interval (how often the wall clock is sampled)
    pub fn with_check_interval(mut self, interval: u64) -> Self {
        self.check_interval = interval.max(1);
        self
    }

    /// Charge `steps` executed steps against the budget.
    pub fn charge(&mut self, steps: u64) -> Result<()> {
        let before = self.used;
        self.used = self.used.saturating_add(steps);

        if self.used > self.max_steps {
            error!(
                operation = %self.operation_name,
                steps = self.used,
                "step budget exhausted"
            );
            return Err(self.exhausted());
        }

        if let Some(max) = self.max_duration {
            // Sample the clock whenever a multiple of the interval is crossed.
            if before / self.check_interval != self.used / self.check_interval {
                let elapsed = self.start.elapsed();
                if elapsed > max {
                    error!(
                        operation = %self.operation_name,
                        steps = self.used,
                        ?elapsed,
                        "time budget exhausted"
                    );
                    return Err(self.exhausted());
                }
                if elapsed > max / 2 && (self.used / self.check_interval) % 16 == 0 {
                    warn!(
                        operation = %self.operation_name,
                        steps = self.used,
                        ?elapsed,
                        "still running past half of the time budget"
                    );
                }
            }
        }
        Ok(())
    }

    /// Charge a single step.
    pub fn check(&mut self) -> Result<()> {
        self.charge(1)
    }

    /// Steps still available. Zero once exhausted.
    pub fn remaining(&self) -> u64 {
        self.max_steps.saturating_sub(self.used)
    }

    /// Number of steps charged so far
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The error reported when this budget runs out.
    pub fn exhausted(&self) -> AnalysisError {
        AnalysisError::BudgetExceeded {
            steps: self.used,
            elapsed_ms: self.start.elapsed().as_millis() as u64,
        }
    }
}
