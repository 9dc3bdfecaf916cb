//! Retry backoff for relay operations.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff between retries of a relay subscribe/publish.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized away (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate backoff delay before retry number `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        let capped = delay_secs.min(self.max_backoff.as_secs_f64());

        if self.jitter > 0.0 && capped > 0.0 {
            let factor = 1.0 - rand::thread_rng().gen_range(0.0..self.jitter);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}
