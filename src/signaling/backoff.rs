//! Polling cadence for candidate and offer discovery

use crate::config::BackoffConfig;
use std::time::Duration;

/// Decides how long to wait before the next poll
pub trait BackoffPolicy: Send + Sync {
    /// `elapsed` since the loop started, `seen` distinct items observed so far
    fn next_delay(&self, elapsed: Duration, seen: usize) -> Duration;
}

/// Fast polling right after start, slower later, idle once the remote trickle looks done
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    config: BackoffConfig,
}

impl AdaptiveBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }
}

impl Default for AdaptiveBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffPolicy for AdaptiveBackoff {
    fn next_delay(&self, elapsed: Duration, seen: usize) -> Duration {
        let c = &self.config;
        if seen >= c.settled_after {
            c.idle_interval
        } else if elapsed < c.fast_window {
            c.fast_interval
        } else if elapsed < c.slow_window {
            c.slow_interval
        } else {
            c.idle_interval
        }
    }
}

/// Same delay every time
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Default for FixedBackoff {
    fn default() -> Self {
        FixedBackoff(Duration::from_secs(1))
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&self, _elapsed: Duration, _seen: usize) -> Duration {
        self.0
    }
}
