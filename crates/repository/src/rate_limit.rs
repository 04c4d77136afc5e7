//! Byte-rate throttling for snapshot uploads and restore downloads.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token-bucket rate limiter over bytes.
///
/// Burst capacity is one second's worth of tokens. A single acquisition may
/// exceed the burst (parts can be larger than the per-second rate); the
/// bucket then goes negative and the caller sleeps off the deficit, which
/// keeps the long-run rate at the configured cap.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A limiter for the given cap; `None` when the cap is 0 (unlimited).
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        Some(Self {
            bytes_per_sec: bytes_per_sec as f64,
            state: Mutex::new(BucketState {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Account `bytes` of transfer, sleeping as needed to honor the cap.
    pub async fn acquire(&self, bytes: u64) {
        let sleep_for = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill);
            state.last_refill = now;
            state.available = (state.available + elapsed.as_secs_f64() * self.bytes_per_sec)
                .min(self.bytes_per_sec);
            state.available -= bytes as f64;
            if state.available < 0.0 {
                Some(Duration::from_secs_f64(-state.available / self.bytes_per_sec))
            } else {
                None
            }
        };
        if let Some(duration) = sleep_for {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Throttle through an optional limiter.
pub async fn maybe_acquire(limiter: &Option<RateLimiter>, bytes: u64) {
    if let Some(limiter) = limiter {
        limiter.acquire(bytes).await;
    }
}
