use std::cmp::min;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Delay between consecutive connect attempts. It starts at the configured initial delay and
///  grows by a factor (in eighths, to stay in integer arithmetic) up to the configured maximum.
pub struct Backoff {
    next_delay: Duration,
    initial_delay: Duration,
    max_delay: Duration,
    factor_eighths: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Backoff {
        let initial_delay = min(config.initial_delay, config.max_delay);
        Backoff {
            next_delay: initial_delay,
            initial_delay,
            max_delay: config.max_delay,
            factor_eighths: config.factor_eighths.max(8),
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(self.next_delay * self.factor_eighths / 8, self.max_delay);
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.initial_delay;
    }
}
