//! Per-source request pacing.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Spaces requests at a fixed minimum interval.
///
/// Each source owns its own limiter; callers queue on the internal lock, so
/// concurrent tasks sharing one limiter are serialised in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter issuing at most `rps` requests per second. Non-positive rates disable pacing.
    pub fn per_second(rps: f64) -> Self {
        let min_interval = if rps > 0.0 && rps.is_finite() {
            Duration::from_secs_f64(1.0 / rps)
        } else {
            Duration::ZERO
        };
        Self { min_interval, last_request: Mutex::new(None) }
    }

    pub fn unlimited() -> Self {
        Self { min_interval: Duration::ZERO, last_request: Mutex::new(None) }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspends until the next request is allowed, then records it.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.min_interval;
            if next > Instant::now() {
                sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}
