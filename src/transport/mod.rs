//! Socket transports implementing [`Stream`](crate::stream::Stream).

pub mod websocket;

pub use websocket::WebSocketStream;

use std::time::Duration;

/// Exponential reconnect backoff.
///
/// The first `min_count` attempts wait `min_timeout`; after that the delay
/// is `base * exponent^attempt`, capped at `max_timeout`, then scaled by a
/// random factor in `[1 - fuzz/2, 1 + fuzz/2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub exponent: f64,
    pub max_timeout: Duration,
    pub min_timeout: Duration,
    pub min_count: u32,
    pub fuzz: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(1),
            exponent: 2.2,
            max_timeout: Duration::from_secs(5 * 60),
            min_timeout: Duration::from_millis(10),
            min_count: 2,
            fuzz: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// `delay` with the random fraction supplied; `fraction` is in `[0, 1)`.
    fn delay_with(&self, attempt: u32, fraction: f64) -> Duration {
        if attempt < self.min_count {
            return self.min_timeout;
        }
        let factor = self.exponent.powi(attempt.min(64) as i32);
        let millis = self.base_timeout.as_millis() as f64 * factor;
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        let jittered = capped * (fraction * self.fuzz + (1.0 - self.fuzz / 2.0));
        Duration::from_millis(jittered as u64)
    }
}

// ── Tests ───────────────────────────────────────────────────────
