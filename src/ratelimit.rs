//! Restart throughput governance.
//!
//! Both reconcilers share one [`Governor`]: a process-wide token bucket caps
//! how often rolling restarts are dispatched, and a per-key exponential
//! backoff slows keys whose reconciles keep failing. When both limiters want
//! a delay, the longer one wins.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::Config;

/// Flat retry delay for pod reconcile failures. Pod retries stay constant
/// because a new watch event re-triggers the work anyway.
const POD_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Base delay for namespace reconcile failures.
const NAMESPACE_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for namespace reconcile backoff.
const NAMESPACE_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Token bucket over restart dispatches.
///
/// Refills at `rate_per_sec` tokens per second up to `burst`. The bucket
/// starts full so a freshly started controller can act on a backlog
/// immediately, up to the burst size.
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_minute: f64, burst: u32) -> Self {
        let rate_per_sec = (rate_per_minute / 60.0).max(f64::MIN_POSITIVE);
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until the next one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.wait_for_token(&state))
        }
    }

    /// Delay until a token would be available, without consuming one.
    pub fn current_wait(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            self.wait_for_token(&state)
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;
    }

    fn wait_for_token(&self, state: &BucketState) -> Duration {
        let deficit = 1.0 - state.tokens;
        Duration::from_secs_f64(deficit / self.rate_per_sec)
    }
}

/// Per-key exponential failure backoff: base * 2^(failures - 1), capped.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return the delay before its next try.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let exp = count.saturating_sub(1).min(63);
        let delay = self.base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        delay.min(self.max)
    }

    /// Clear the failure count for `key` after a successful reconcile.
    pub fn reset(&self, key: &str) {
        self.failures.lock().remove(key);
    }
}

/// Composite limiter shared by both reconcilers.
pub struct Governor {
    bucket: TokenBucket,
    namespace_backoff: Backoff,
}

impl Governor {
    pub fn new(config: &Config) -> Self {
        Self {
            bucket: TokenBucket::new(config.restarts_per_minute, config.active_restart_limit),
            namespace_backoff: Backoff::new(NAMESPACE_BACKOFF_BASE, NAMESPACE_BACKOFF_MAX),
        }
    }

    /// Claim restart budget for one dispatch. Dry-run dispatches claim budget
    /// too, so rate behavior can be observed without side effects.
    pub fn try_acquire_restart(&self) -> Result<(), Duration> {
        self.bucket.try_acquire()
    }

    /// Requeue delay after a failed namespace reconcile: the slower of the
    /// exponential backoff and the restart budget.
    pub fn namespace_retry_delay(&self, key: &str) -> Duration {
        self.namespace_backoff
            .next_delay(key)
            .max(self.bucket.current_wait())
    }

    /// Requeue delay after a failed pod reconcile: flat retry, still bounded
    /// below by the restart budget.
    pub fn pod_retry_delay(&self) -> Duration {
        POD_RETRY_DELAY.max(self.bucket.current_wait())
    }

    pub fn record_namespace_success(&self, key: &str) {
        self.namespace_backoff.reset(key);
    }
}
