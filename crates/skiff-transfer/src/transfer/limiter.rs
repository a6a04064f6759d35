// ── RateLimiter – token bucket over tokio time ──────────────────────────────

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

struct Bucket {
    /// May go negative: callers that overdraw sleep off the debt, so a
    /// chunk larger than one second's budget still passes through.
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter in KB/s. Capacity is one second's worth of
/// tokens, which is the burst the engine tolerates after an idle spell.
/// A rate of 0 bypasses the bucket entirely.
pub struct RateLimiter {
    rate_kbps: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate_kbps: u64) -> Self {
        RateLimiter {
            rate_kbps: AtomicU64::new(rate_kbps),
            bucket: Mutex::new(Bucket {
                tokens: (rate_kbps * 1024) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_kbps(&self) -> u64 {
        self.rate_kbps.load(Ordering::Relaxed)
    }

    /// Change the rate. Takes effect for the next `acquire`, including
    /// ones currently sleeping off a debt (they re-read the rate).
    pub fn set_rate(&self, rate_kbps: u64) {
        self.rate_kbps.store(rate_kbps, Ordering::Relaxed);
        let mut bucket = self.lock();
        let cap = (rate_kbps * 1024) as f64;
        if bucket.tokens > cap {
            bucket.tokens = cap;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        match self.bucket.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Refill at the current rate, returning the remaining debt as a
    /// sleep duration (zero when the bucket is solvent).
    fn refill(&self, charge: f64) -> Duration {
        let rate = self.rate_kbps.load(Ordering::Relaxed);
        let mut bucket = self.lock();
        if rate == 0 {
            // Limit lifted; forgive any debt so the next acquire with a
            // restored rate starts from the burst allowance.
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
            return Duration::ZERO;
        }
        let bytes_per_sec = (rate * 1024) as f64;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * bytes_per_sec).min(bytes_per_sec);
        bucket.tokens -= charge;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bytes_per_sec)
        }
    }

    /// Take `bytes` tokens, sleeping until the bucket can cover them.
    /// Never called with a queue or task lock held.
    pub async fn acquire(&self, bytes: u64) {
        if self.rate_kbps.load(Ordering::Relaxed) == 0 {
            return;
        }
        // Charge once, then sleep off whatever debt remains; the rate
        // is re-read on every pass so set_rate lands mid-acquire.
        let mut wait = self.refill(bytes as f64);
        while wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
            wait = self.refill(0.0);
        }
    }
}
