//! Fault injection for drills: synthetic 500s and artificial latency.

use std::time::Duration;

pub const DEFAULT_SLOW_MODE_DELAY_MS: u64 = 1000;

/// Process-wide fault defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultConfig {
    pub failure_mode: bool,
    pub slow_mode: bool,
    pub slow_mode_delay_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            failure_mode: false,
            slow_mode: false,
            slow_mode_delay_ms: DEFAULT_SLOW_MODE_DELAY_MS,
        }
    }
}

/// What the orchestrator should do for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDecision {
    pub simulate_failure: bool,
    pub delay_ms: u64,
}

impl FaultDecision {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    config: FaultConfig,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        Self { config }
    }

    /// A per-request override can switch a fault on but never off: each flag
    /// is `override OR default`.
    pub fn resolve(&self, failure_override: Option<bool>, slow_override: Option<bool>) -> FaultDecision {
        let simulate_failure = failure_override.unwrap_or(false) || self.config.failure_mode;
        let slow = slow_override.unwrap_or(false) || self.config.slow_mode;
        FaultDecision {
            simulate_failure,
            delay_ms: if slow { self.config.slow_mode_delay_ms } else { 0 },
        }
    }
}
