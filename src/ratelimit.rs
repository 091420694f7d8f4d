//! Token-bucket throttle for outbound sends.
//!
//! Two scopes: one global bucket shared by every job, and an optional bucket
//! per job. A send needs one token from each applicable bucket. Tokens refill
//! continuously at `rate` per second up to `capacity`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::clock::Clock;
use crate::config::EngineConfig;

/// Smallest deferral, so float rounding never turns into a busy loop.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest single deferral. A bucket that can never refill still wakes up.
const MAX_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
}

/// Result of taking one token from a single bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Take {
    pub granted: bool,
    /// Whole tokens left afterwards.
    pub remaining: u32,
    /// Until the next token. Zero when granted.
    pub wait: Duration,
    /// Until the bucket is full again.
    pub full_in: Duration,
}

/// A continuously refilling bucket. Starts full.
///
/// A non-positive or non-finite rate never refills; waits are capped at
/// `MAX_WAIT` and re-checked.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, rate_per_sec: f64) -> Self {
        let rate_per_sec = if rate_per_sec.is_finite() && rate_per_sec > 0.0 {
            rate_per_sec
        } else {
            0.0
        };
        Self {
            capacity: f64::from(capacity.max(1)),
            rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity.max(1)),
                last_refill: None,
            }),
        }
    }

    /// Bucket refilling at `per_minute / 60` tokens per second.
    pub fn per_minute(capacity: u32, per_minute: u32) -> Self {
        Self::new(capacity, f64::from(per_minute) / 60.0)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// Tokens available at `now` (after refill).
    pub fn available(&self, now: DateTime<Utc>) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Take one token if available, reporting what is left either way.
    pub fn take(&self, now: DateTime<Utc>) -> Take {
        let mut state = self.lock();
        self.refill(&mut state, now);
        let wait = self.deficit(&state);
        let granted = wait.is_zero();
        if granted {
            state.tokens -= 1.0;
        }
        Take {
            granted,
            remaining: state.tokens.max(0.0).floor() as u32,
            wait,
            full_in: self.time_to_full(&state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, state: &mut BucketState, now: DateTime<Utc>) {
        if let Some(last) = state.last_refill {
            let elapsed = now
                .signed_duration_since(last)
                .num_microseconds()
                .unwrap_or(i64::MAX)
                .max(0) as f64
                / 1_000_000.0;
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        }
        state.last_refill = Some(now);
    }

    /// Time until one full token is available.
    fn deficit(&self, state: &BucketState) -> Duration {
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.rate_per_sec == 0.0 {
            return MAX_WAIT;
        }
        Duration::try_from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
            .unwrap_or(MAX_WAIT)
            .clamp(MIN_WAIT, MAX_WAIT)
    }

    fn time_to_full(&self, state: &BucketState) -> Duration {
        let missing = self.capacity - state.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.rate_per_sec == 0.0 {
            return MAX_WAIT;
        }
        Duration::try_from_secs_f64(missing / self.rate_per_sec)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT)
    }

    fn refund(&self, state: &mut BucketState) {
        state.tokens = (state.tokens + 1.0).min(self.capacity);
    }
}

/// Global + per-job throttle. Clone-cheap via `Arc`.
pub struct RateLimiter {
    global: TokenBucket,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(global: TokenBucket, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self { global, clock })
    }

    /// Global bucket from the engine config.
    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new(
            TokenBucket::per_minute(config.global_burst, config.global_rate_per_minute),
            clock,
        )
    }

    /// Per-job bucket from the engine config, if a per-job ceiling is set.
    pub fn job_bucket(config: &EngineConfig) -> Option<TokenBucket> {
        config
            .job_rate_per_minute
            .map(|rate| TokenBucket::per_minute(config.job_burst, rate))
    }

    pub fn global(&self) -> &TokenBucket {
        &self.global
    }

    /// Take one token from both buckets, or report how long to wait.
    ///
    /// Either both tokens are taken or neither is.
    pub fn try_acquire(&self, job: Option<&TokenBucket>) -> Result<(), Duration> {
        let now = self.clock.now();

        // Lock order: job bucket, then global.
        let mut job_state = job.map(|b| (b, b.lock()));
        let mut global_state = self.global.lock();

        if let Some((bucket, state)) = job_state.as_mut() {
            bucket.refill(state, now);
        }
        self.global.refill(&mut global_state, now);

        let job_wait = job_state
            .as_ref()
            .map(|(bucket, state)| bucket.deficit(state))
            .unwrap_or(Duration::ZERO);
        let global_wait = self.global.deficit(&global_state);
        let wait = job_wait.max(global_wait);

        if !wait.is_zero() {
            return Err(wait);
        }

        if let Some((_, state)) = job_state.as_mut() {
            state.tokens -= 1.0;
        }
        global_state.tokens -= 1.0;
        Ok(())
    }

    /// Return a token taken by `try_acquire` that ended up unused.
    pub fn release(&self, job: Option<&TokenBucket>) {
        if let Some(bucket) = job {
            bucket.refund(&mut bucket.lock());
        }
        self.global.refund(&mut self.global.lock());
    }

    /// Wait until a token is granted from both buckets.
    pub async fn acquire(&self, job: Option<&TokenBucket>) {
        loop {
            match self.try_acquire(job) {
                Ok(()) => return,
                Err(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "Rate limited, deferring send");
                    self.clock.sleep(wait).await;
                }
            }
        }
    }
}
