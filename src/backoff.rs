//! Retry delay policy for the long-running worker loops.
//!
//! Both loops distinguish fatal startup errors (propagated, process exits)
//! from steady-state errors inside the loop body. The latter are logged and
//! followed by the delay this policy returns; the failure streak resets after
//! the next successful iteration.

use std::time::Duration;

use crate::config::{BackoffConfig, BackoffStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            strategy: config.strategy,
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
        }
    }

    /// Delay after `failures` consecutive failed iterations (1-based).
    ///
    /// Exponential: `base * 2^(failures-1)`, shift capped at 2^5, then capped
    /// at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Exponential => {
                let shift = failures.saturating_sub(1).min(5);
                self.base.saturating_mul(1 << shift).min(self.max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
