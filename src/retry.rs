//! Bounded exponential backoff with jitter for store operations.
//!
//! A [`RetryPolicy`] runs one store operation, retrying transient failures
//! until the elapsed-time budget runs out or an [`Interrupt`] is observed.
//! Permanent failures and exhausted budgets return the last underlying error
//! unchanged.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::{ErrorKind, RedisError};
use tracing::warn;

use crate::interrupt::Interrupt;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.1;
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(120);

/// Classification of failures into retryable and permanent.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for RedisError {
    fn is_transient(&self) -> bool {
        match self.kind() {
            ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => false,
            ErrorKind::BusyLoadingError
            | ErrorKind::TryAgain
            | ErrorKind::ClusterDown
            | ErrorKind::MasterDown
            | ErrorKind::Moved
            | ErrorKind::Ask => true,
            _ => {
                self.is_timeout()
                    || self.is_io_error()
                    || self.is_connection_dropped()
                    || self.is_connection_refusal()
            }
        }
    }
}

impl Transient for crate::Error {
    fn is_transient(&self) -> bool {
        self.as_store().is_some_and(Transient::is_transient)
    }
}

/// Retry envelope for a single store operation.
#[derive(Clone)]
pub struct RetryPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    jitter: f64,
    max_elapsed: Duration,
    interrupt: Option<Arc<dyn Interrupt>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("max_elapsed", &self.max_elapsed)
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            max_elapsed: DEFAULT_MAX_ELAPSED,
            interrupt: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().max_elapsed(Duration::ZERO)
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Growth factor between retries. Values below 1 are raised to 1, and
    /// non-finite values fall back to the default.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    /// Jitter as a fraction of the current interval (0.1 = up to 10% extra),
    /// clamped to `0.0..=1.0`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        self
    }

    pub fn max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Stop retrying as soon as `interrupt` reports true.
    pub fn interrupt(mut self, interrupt: Arc<dyn Interrupt>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Pre-jitter wait before retry number `attempt` (0-based), capped at the max interval.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_interval.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let fraction = self.jitter * rand::random::<f64>();
        let extra =
            Duration::try_from_secs_f64(base.as_secs_f64() * fraction).unwrap_or(Duration::ZERO);
        base.saturating_add(extra).min(self.max_interval)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|i| i.is_interrupted())
    }

    /// Decide what to do after a failed attempt: `Some(wait)` to retry, `None` to give up.
    fn next_delay<E>(&self, operation: &str, attempt: u32, started: Instant, err: &E) -> Option<Duration>
    where
        E: Transient + fmt::Display,
    {
        if !err.is_transient() {
            return None;
        }
        if self.interrupted() {
            warn!(operation, error = %err, "interrupted, not retrying");
            return None;
        }
        let elapsed = started.elapsed();
        if elapsed >= self.max_elapsed {
            return None;
        }

        let delay = self
            .jittered(self.base_delay(attempt))
            .min(self.max_elapsed - elapsed);
        warn!(
            operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "store operation failed, retrying"
        );
        metrics::store_retries().add(1, &[KeyValue::new("operation", operation.to_string())]);
        Some(delay)
    }

    /// Run a blocking operation under this policy.
    pub fn call<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Transient + fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay(operation, attempt, started, &err) {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(err),
                },
            }
            attempt += 1;
        }
    }

    /// Run an async operation under this policy; waits suspend only the calling task.
    pub async fn call_async<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay(operation, attempt, started, &err) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(err),
                },
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn default_schedule_doubles_from_ten_millis() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_millis(10));
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        assert_eq!(policy.base_delay(20), DEFAULT_MAX_INTERVAL);
        assert_eq!(policy.base_delay(u32::MAX), DEFAULT_MAX_INTERVAL);
    }

    #[test]
    fn jitter_stays_within_fraction_and_cap() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(110));
        }
        let capped = policy.jittered(DEFAULT_MAX_INTERVAL);
        assert_eq!(capped, DEFAULT_MAX_INTERVAL);
    }

    #[test]
    fn out_of_range_multiplier_never_shrinks_or_panics() {
        let shrinking = RetryPolicy::default().multiplier(-2.0);
        let initial = DEFAULT_INITIAL_INTERVAL;
        for attempt in 0..8 {
            assert!(shrinking.base_delay(attempt) >= initial);
        }
        assert_eq!(shrinking.base_delay(1), initial);

        let nan = RetryPolicy::default().multiplier(f64::NAN);
        assert_eq!(nan.base_delay(1), Duration::from_millis(20));
        let inf = RetryPolicy::default().multiplier(f64::INFINITY);
        assert_eq!(inf.base_delay(1), Duration::from_millis(20));
    }

    #[test]
    fn out_of_range_jitter_stays_under_the_cap() {
        let huge = RetryPolicy::default()
            .max_interval(Duration::MAX)
            .jitter(f64::MAX);
        for _ in 0..100 {
            let d = huge.jittered(Duration::from_secs(u64::MAX / 2));
            assert!(d >= Duration::from_secs(u64::MAX / 2));
        }
        let d = huge.jittered(Duration::from_millis(100));
        assert!(d <= Duration::from_millis(200));

        let negative = RetryPolicy::default().jitter(-5.0);
        assert_eq!(negative.jittered(Duration::from_millis(100)), Duration::from_millis(100));
        let nan = RetryPolicy::default().jitter(f64::NAN);
        assert_eq!(nan.jittered(Duration::from_millis(100)), Duration::from_millis(100));
    }

    #[test]
    fn classifies_redis_errors() {
        let transient = [
            RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
            RedisError::from((ErrorKind::BusyLoadingError, "loading")),
            RedisError::from((ErrorKind::ClusterDown, "down")),
            RedisError::from((ErrorKind::TryAgain, "again")),
        ];
        for err in &transient {
            assert!(err.is_transient(), "{err} should be transient");
        }

        let permanent = [
            RedisError::from((ErrorKind::AuthenticationFailed, "bad password")),
            RedisError::from((ErrorKind::ResponseError, "WRONGTYPE")),
            RedisError::from((ErrorKind::TypeError, "type")),
        ];
        for err in &permanent {
            assert!(!err.is_transient(), "{err} should be permanent");
        }
    }

    #[test]
    fn crate_error_delegates_to_store_error() {
        let store: crate::Error = RedisError::from((ErrorKind::TryAgain, "again")).into();
        assert!(store.is_transient());
        assert!(!crate::Error::Config("x".into()).is_transient());
    }
}
