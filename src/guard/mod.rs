//! Admission guards: replay protection and rate limiting.
//!
//! Both structures are bounded, serialize their mutations behind a lock, and
//! run on the monotonic clock — wall-clock skew cannot resurrect a nonce or
//! refill a bucket, because aging is measured in monotonic elapsed time.
//!
//! Single-process authority: when multiple workers are deployed these must
//! be externalized to a shared store; that is a deployment concern outside
//! this crate.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Minimum nonce TTL the store will accept.
pub const MIN_NONCE_TTL: Duration = Duration::from_secs(5 * 60);
/// Bucket-map size above which idle buckets are swept.
const RATE_BUCKET_SWEEP_THRESHOLD: usize = 10_000;

/// A replayed nonce was presented.
#[derive(Debug, Error, Diagnostic)]
#[error("nonce replayed: {nonce}")]
#[diagnostic(
    code(veritas::guard::nonce_replayed),
    help("Each signed request must carry a fresh nonce.")
)]
pub struct ReplayError {
    pub nonce: String,
}

/// TTL-bounded nonce store for replay protection.
pub struct NonceStore {
    ttl: Duration,
    seen: Mutex<FxHashMap<String, Instant>>,
}

impl NonceStore {
    /// Create a store; TTLs below the five-minute floor are raised to it.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.max(MIN_NONCE_TTL),
            seen: Mutex::new(FxHashMap::default()),
        }
    }

    /// The effective TTL after clamping.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a nonce, rejecting replays within the TTL window.
    pub fn register(&self, nonce: &str) -> Result<(), ReplayError> {
        self.register_at(nonce, Instant::now())
    }

    fn register_at(&self, nonce: &str, now: Instant) -> Result<(), ReplayError> {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Age out expired nonces by monotonic elapsed time.
        seen.retain(|_, stamp| now.saturating_duration_since(*stamp) < self.ttl);

        if seen.contains_key(nonce) {
            return Err(ReplayError {
                nonce: nonce.to_string(),
            });
        }
        seen.insert(nonce.to_string(), now);
        Ok(())
    }
}

/// Per-key token-bucket rate limiter.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<FxHashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// A limiter allowing bursts of `capacity` and a sustained
    /// `refill_per_sec` rate per client key.
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            buckets: Mutex::new(FxHashMap::default()),
        }
    }

    /// Take one token for `key`; `false` means the caller is rate limited.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if buckets.len() > RATE_BUCKET_SWEEP_THRESHOLD {
            let capacity = self.capacity;
            let refill = self.refill_per_sec;
            buckets.retain(|_, b| {
                let refilled =
                    b.tokens + now.saturating_duration_since(b.last).as_secs_f64() * refill;
                refilled < capacity
            });
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
