// Retry backoff for failed jobs: base * 2^attempts + jitter, capped.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            max_delay_ms: 600_000,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            multiplier,
            max_delay_ms,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt given how many have already run.
    pub fn delay_ms(&self, attempts: u32, base_ms: u64) -> u64 {
        let exp = self.multiplier.powi(attempts.min(24) as i32);
        let mut delay = ((base_ms as f64) * exp).min(self.max_delay_ms as f64) as u64;

        // ±20% jitter spreads synchronized retries.
        if self.jitter {
            let spread = (delay as f64 * 0.2) as u64;
            let offset = (rand::random::<f64>() * (spread as f64 * 2.0)) as u64;
            delay = delay.saturating_add(offset).saturating_sub(spread);
        }

        delay
    }

    pub fn delay(&self, attempts: u32, base_ms: u64) -> Duration {
        Duration::from_millis(self.delay_ms(attempts, base_ms))
    }
}
