//! Admission-control rate limiters
//!
//! Both limiters are token buckets refilled on a timer task. `acquire`
//! resolves once a token is granted and reports whether the limiter is still
//! open; `stop` closes the limiter, which wakes every waiter and makes all
//! subsequent `acquire` calls return `false` so workers exit promptly.
//!
//! Refill is driven by the tokio monotonic clock. Timer skew is tolerated:
//! over-delivery within one refill window is bounded by the bucket size.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::error::{Error, Result};

/// Default refill period of both limiter variants.
pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(1);

/// Admission control seen by workers.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Launch the refill timers. Idempotent.
    fn start(&self);

    /// Take one token, suspending until one is available. Returns `false`
    /// once the limiter has been stopped.
    async fn acquire(&self) -> bool;

    /// Close the limiter and wake all waiters. Idempotent.
    fn stop(&self);
}

/// Shared token store. Waiters park on `refill` and re-check after every
/// refill or close.
#[derive(Debug)]
struct Bucket {
    tokens: AtomicI64,
    closed: AtomicBool,
    refill: Notify,
}

impl Bucket {
    fn new(initial: i64) -> Self {
        Self {
            tokens: AtomicI64::new(initial),
            closed: AtomicBool::new(false),
            refill: Notify::new(),
        }
    }

    fn try_take(&self) -> bool {
        let mut current = self.tokens.load(Ordering::Acquire);
        while current > 0 {
            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    async fn acquire(&self) -> bool {
        loop {
            // Register interest before the checks so a refill that lands in
            // between still wakes us.
            let mut notified = pin!(self.refill.notified());
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            if self.try_take() {
                return true;
            }
            notified.await;
        }
    }

    fn refill_to(&self, max: i64) {
        self.tokens.store(max, Ordering::Release);
        self.refill.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.refill.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Fixed-rate token bucket: refilled to `max_tokens` every `refill_period`.
///
/// Admits at most `max_tokens * T / refill_period + max_tokens` tokens over
/// any interval of length `T`.
#[derive(Debug)]
pub struct StableRateLimiter {
    max_tokens: i64,
    refill_period: Duration,
    bucket: Arc<Bucket>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StableRateLimiter {
    /// Create a bucket holding `max_tokens` per [`DEFAULT_REFILL_PERIOD`].
    pub fn new(max_tokens: i64) -> Result<Self> {
        Self::with_period(max_tokens, DEFAULT_REFILL_PERIOD)
    }

    /// Create a bucket holding `max_tokens` per `refill_period`.
    pub fn with_period(max_tokens: i64, refill_period: Duration) -> Result<Self> {
        if max_tokens <= 0 {
            return Err(Error::Config(format!(
                "max tokens must be positive, was {max_tokens}"
            )));
        }
        if refill_period.is_zero() {
            return Err(Error::Config("refill period must be non-zero".into()));
        }
        Ok(Self {
            max_tokens,
            refill_period,
            bucket: Arc::new(Bucket::new(max_tokens)),
            timer: Mutex::new(None),
        })
    }
}

#[async_trait]
impl RateLimiter for StableRateLimiter {
    fn start(&self) {
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return;
        }
        let bucket = Arc::clone(&self.bucket);
        let max = self.max_tokens;
        let period = self.refill_period;
        *timer = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if bucket.is_closed() {
                    break;
                }
                bucket.refill_to(max);
            }
        }));
    }

    async fn acquire(&self) -> bool {
        self.bucket.acquire().await
    }

    fn stop(&self) {
        self.bucket.close();
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// Token bucket with a linear ramp-up of the refill rate.
///
/// Every `step_period` the active bucket size grows by `step_tokens`, capped
/// at `target_max`; refills use the active size. The active size is
/// monotonically non-decreasing.
#[derive(Debug)]
pub struct RampedRateLimiter {
    target_max: i64,
    step_tokens: i64,
    step_period: Duration,
    refill_period: Duration,
    active_max: Arc<AtomicI64>,
    bucket: Arc<Bucket>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RampedRateLimiter {
    /// Create a ramped bucket from an increase-rate spec (`"N"` or
    /// `"N/Ms"`, e.g. `"100"` or `"100/3s"`).
    pub fn new(target_max: i64, increase_rate: &str) -> Result<Self> {
        let (step_tokens, step_period) = parse_increase_rate(increase_rate)?;
        Self::with_steps(target_max, step_tokens, step_period, DEFAULT_REFILL_PERIOD)
    }

    /// Create a ramped bucket from explicit parameters.
    pub fn with_steps(
        target_max: i64,
        step_tokens: i64,
        step_period: Duration,
        refill_period: Duration,
    ) -> Result<Self> {
        if target_max <= 0 {
            return Err(Error::Config(format!(
                "target max must be positive, was {target_max}"
            )));
        }
        if step_tokens <= 0 {
            return Err(Error::Config(format!(
                "ramp step must be positive, was {step_tokens}"
            )));
        }
        if step_period.is_zero() || refill_period.is_zero() {
            return Err(Error::Config("ramp periods must be non-zero".into()));
        }
        let initial = step_tokens.min(target_max);
        Ok(Self {
            target_max,
            step_tokens,
            step_period,
            refill_period,
            active_max: Arc::new(AtomicI64::new(initial)),
            bucket: Arc::new(Bucket::new(initial)),
            timer: Mutex::new(None),
        })
    }

    /// The currently active bucket size.
    pub fn active_max(&self) -> i64 {
        self.active_max.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RateLimiter for RampedRateLimiter {
    fn start(&self) {
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return;
        }
        let bucket = Arc::clone(&self.bucket);
        let active = Arc::clone(&self.active_max);
        let target = self.target_max;
        let step = self.step_tokens;
        let start = Instant::now();
        let mut refill_ticks = interval_at(start + self.refill_period, self.refill_period);
        let mut step_ticks = interval_at(start + self.step_period, self.step_period);
        *timer = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = refill_ticks.tick() => {
                        bucket.refill_to(active.load(Ordering::Acquire));
                    }
                    _ = step_ticks.tick() => {
                        let current = active.load(Ordering::Acquire);
                        let next = (current + step).min(target);
                        active.store(next, Ordering::Release);
                    }
                }
                if bucket.is_closed() {
                    break;
                }
            }
        }));
    }

    async fn acquire(&self) -> bool {
        self.bucket.acquire().await
    }

    fn stop(&self) {
        self.bucket.close();
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

/// Parse an increase-rate spec: `"N"` means N tokens per second, `"N/Ms"`
/// means N tokens per the given period (`"100/3s"`).
pub fn parse_increase_rate(spec: &str) -> Result<(i64, Duration)> {
    let (tokens, period) = match spec.split_once('/') {
        None => (spec.trim(), None),
        Some((tokens, period)) => (tokens.trim(), Some(period.trim())),
    };
    let tokens: i64 = tokens
        .parse()
        .map_err(|_| Error::Config(format!("invalid increase rate {spec:?}")))?;
    if tokens <= 0 {
        return Err(Error::Config(format!(
            "increase rate must be positive, was {spec:?}"
        )));
    }
    let period = match period {
        None => Duration::from_secs(1),
        Some(p) => humantime::parse_duration(p)
            .map_err(|e| Error::Config(format!("invalid increase-rate period {spec:?}: {e}")))?,
    };
    if period.is_zero() {
        return Err(Error::Config(format!(
            "increase-rate period must be non-zero, was {spec:?}"
        )));
    }
    Ok((tokens, period))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_parse_increase_rate_plain() {
        let (tokens, period) = parse_increase_rate("100").unwrap();
        assert_eq!(tokens, 100);
        assert_eq!(period, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_increase_rate_with_period() {
        let (tokens, period) = parse_increase_rate("100/3s").unwrap();
        assert_eq!(tokens, 100);
        assert_eq!(period, Duration::from_secs(3));

        let (tokens, period) = parse_increase_rate("7/500ms").unwrap();
        assert_eq!(tokens, 7);
        assert_eq!(period, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_increase_rate_rejects_garbage() {
        assert!(parse_increase_rate("").is_err());
        assert!(parse_increase_rate("abc").is_err());
        assert!(parse_increase_rate("0").is_err());
        assert!(parse_increase_rate("-5").is_err());
        assert!(parse_increase_rate("10/").is_err());
        assert!(parse_increase_rate("10/fast").is_err());
    }

    #[test]
    fn test_stable_rejects_non_positive_max() {
        assert!(StableRateLimiter::new(0).is_err());
        assert!(StableRateLimiter::new(-1).is_err());
    }

    #[tokio::test]
    async fn test_stable_starts_full() {
        let limiter = StableRateLimiter::new(3).unwrap();
        for _ in 0..3 {
            assert!(limiter.acquire().await);
        }
    }

    #[tokio::test]
    async fn test_stable_blocks_when_drained_until_refill() {
        let limiter = StableRateLimiter::with_period(1, Duration::from_millis(50)).unwrap();
        limiter.start();
        assert!(limiter.acquire().await);

        // Drained: the next acquire must wait for the refill timer.
        let blocked = timeout(Duration::from_millis(10), limiter.acquire()).await;
        assert!(blocked.is_err());

        let granted = timeout(Duration::from_millis(200), limiter.acquire()).await;
        assert_eq!(granted.ok(), Some(true));
        limiter.stop();
    }

    #[tokio::test]
    async fn test_stable_admission_is_bounded() {
        let period = Duration::from_millis(50);
        let limiter = StableRateLimiter::with_period(10, period).unwrap();
        limiter.start();

        let deadline = Instant::now() + Duration::from_millis(175);
        let mut admitted = 0u64;
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(5), limiter.acquire()).await {
                Ok(true) => admitted += 1,
                Ok(false) => break,
                Err(_) => continue,
            }
        }
        limiter.stop();

        // R*T/period + R with R=10, T=175ms, period=50ms => 45.
        assert!(admitted <= 45, "admitted {admitted} tokens");
        assert!(admitted >= 10, "admitted {admitted} tokens");
    }

    #[tokio::test]
    async fn test_stop_unblocks_waiters_with_closed() {
        let limiter = Arc::new(StableRateLimiter::new(1).unwrap());
        assert!(limiter.acquire().await);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.stop();

        assert!(!waiter.await.unwrap());
        assert!(!limiter.acquire().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let limiter = StableRateLimiter::new(1).unwrap();
        limiter.start();
        limiter.stop();
        limiter.stop();
        assert!(!limiter.acquire().await);
    }

    #[tokio::test]
    async fn test_ramp_active_max_is_monotone_and_capped() {
        let limiter =
            RampedRateLimiter::with_steps(3, 1, Duration::from_millis(30), Duration::from_millis(30))
                .unwrap();
        assert_eq!(limiter.active_max(), 1);
        limiter.start();

        let mut previous = limiter.active_max();
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = limiter.active_max();
            assert!(current >= previous, "active max regressed");
            assert!(current <= 3, "active max overshot the target");
            previous = current;
        }
        assert_eq!(previous, 3);
        limiter.stop();
    }

    #[tokio::test]
    async fn test_ramp_initial_step_capped_by_target() {
        let limiter =
            RampedRateLimiter::with_steps(2, 10, Duration::from_secs(1), Duration::from_secs(1))
                .unwrap();
        assert_eq!(limiter.active_max(), 2);
    }

    #[test]
    fn test_ramp_from_spec() {
        let limiter = RampedRateLimiter::new(100, "10/2s").unwrap();
        assert_eq!(limiter.active_max(), 10);
        assert!(RampedRateLimiter::new(100, "nope").is_err());
        assert!(RampedRateLimiter::new(0, "10").is_err());
    }
}
