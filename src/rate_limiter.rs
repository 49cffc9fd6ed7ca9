//! Token-bucket rate limiter gating every outbound send.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Classical token bucket. A zero `rate_per_second` means unlimited: `allow`
/// always grants and `wait` never blocks.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate_per_second: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Granted,
    Cancelled,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            rate_per_second,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Unlimited limiter: every `allow` grants immediately, `wait` never
    /// suspends.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    fn refill(&self, bucket: &mut Bucket) {
        if self.rate_per_second <= 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    /// Non-blocking consume of a single token.
    pub fn allow(&self) -> bool {
        if self.rate_per_second <= 0.0 {
            return true;
        }
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until at least one token will be available. Zero if one is
    /// already available.
    fn time_until_available(&self) -> Duration {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - bucket.tokens;
        Duration::from_secs_f64(deficit / self.rate_per_second)
    }

    /// Blocks cooperatively until a token is available or `cancel` fires.
    /// Rechecks on every wake, tolerating spurious wakeups.
    pub async fn wait(&self, cancel: &CancellationToken) -> WaitOutcome {
        loop {
            if self.allow() {
                return WaitOutcome::Granted;
            }
            let delay = self.time_until_available().max(Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
