//! Outbound call governance: token bucket + retry policy.
//!
//! A [`Governor`] is scoped to one orchestrator. [`GovernedTracker`] wraps any
//! [`Tracker`] so that every port call takes a token first and transient
//! failures are retried with capped exponential backoff and jitter.
//!
//! The bucket is a sliding window: each spent token comes back exactly one
//! refill period after it was spent, so any window of one period admits at
//! most `capacity` calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use epicsync_core::config::{RateLimitConfig, RetryConfig, SyncConfig};
use epicsync_core::error::TrackerError;
use epicsync_core::issue::{CreatedIssue, FieldUpdate, NewIssue, TrackerIssue};
use epicsync_core::tracker::{Capabilities, Tracker};
use epicsync_core::types::{IssueKey, Status};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic time source. Injected so limiter and backoff can be tested
/// without sleeping.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

pub struct TokenBucket {
    capacity: usize,
    period: Duration,
    /// Spend times of tokens not yet returned, oldest first.
    spent: Mutex<VecDeque<Duration>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    pub fn new(capacity: u32, period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1) as usize,
            period,
            spent: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    pub fn from_config(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.capacity,
            Duration::from_millis(config.refill_period_ms),
            clock,
        )
    }

    /// Take a token without waiting. Returns the wait needed when empty.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut spent = self.spent.lock();
        while let Some(&oldest) = spent.front() {
            if oldest + self.period <= now {
                spent.pop_front();
            } else {
                break;
            }
        }
        if spent.len() < self.capacity {
            spent.push_back(now);
            return Ok(());
        }
        // `front` exists: the queue is full and capacity >= 1.
        let oldest = spent.front().copied().unwrap_or(now);
        Err((oldest + self.period).saturating_sub(now))
    }

    /// Block until a token is available. Returns how many waits it took.
    pub fn acquire(&self) -> u32 {
        let mut waits = 0;
        loop {
            match self.try_acquire() {
                Ok(()) => return waits,
                Err(wait) => {
                    waits += 1;
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit: waiting for token");
                    self.clock.sleep(wait);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// Fix the jitter sequence.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based): `base · 2^(retry-1)`,
    /// capped at `max_delay`, then scaled by a factor in `[1-j, 1+j]`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if self.jitter == 0.0 {
            return capped;
        }
        let factor = self
            .rng
            .lock()
            .gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        capped.mul_f64(factor)
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Counters exposed for reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GovernorStats {
    /// Attempts that reached the tracker, retries included.
    pub calls: u64,
    pub retries: u64,
    /// Times a caller had to wait for a token.
    pub throttled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    retries: AtomicU64,
    throttled: AtomicU64,
}

pub struct Governor {
    bucket: TokenBucket,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Governor {
    pub fn new(bucket: TokenBucket, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            bucket,
            retry,
            clock,
            counters: Counters::default(),
        }
    }

    /// Limiter and retry settings from config, on the given clock.
    pub fn from_config(config: &SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            TokenBucket::from_config(config.effective_rate_limit(), clock.clone()),
            RetryPolicy::from_config(&config.retry),
            clock,
        )
    }

    /// Governor on the system clock.
    pub fn system(config: &SyncConfig) -> Self {
        Self::from_config(config, Arc::new(SystemClock::default()))
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
        }
    }

    /// Run `f` under the limiter, retrying transient failures.
    pub fn call<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, TrackerError>,
    ) -> Result<T, TrackerError> {
        let max = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            let waits = self.bucket.acquire();
            if waits > 0 {
                self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.calls.fetch_add(1, Ordering::Relaxed);
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient tracker error, retrying"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.clock.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::debug!(operation, attempt, error = %err, "tracker call failed");
                    return Err(err);
                }
            }
        }
    }
}

/// A [`Tracker`] whose every call goes through a [`Governor`].
pub struct GovernedTracker<'a> {
    inner: &'a dyn Tracker,
    governor: &'a Governor,
}

impl<'a> GovernedTracker<'a> {
    pub fn new(inner: &'a dyn Tracker, governor: &'a Governor) -> Self {
        Self { inner, governor }
    }

    pub fn governor(&self) -> &Governor {
        self.governor
    }
}

impl Tracker for GovernedTracker<'_> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn fetch_epic_children(&self, epic: &IssueKey) -> Result<Vec<TrackerIssue>, TrackerError> {
        self.governor
            .call("fetch_epic_children", || self.inner.fetch_epic_children(epic))
    }

    fn fetch_issue(&self, key: &IssueKey) -> Result<TrackerIssue, TrackerError> {
        self.governor.call("fetch_issue", || self.inner.fetch_issue(key))
    }

    fn create_story(&self, epic: &IssueKey, data: &NewIssue) -> Result<CreatedIssue, TrackerError> {
        self.governor
            .call("create_story", || self.inner.create_story(epic, data))
    }

    fn update_story(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.governor
            .call("update_story", || self.inner.update_story(key, fields))
    }

    fn create_subtask(
        &self,
        parent: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        self.governor
            .call("create_subtask", || self.inner.create_subtask(parent, data))
    }

    fn update_subtask(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.governor
            .call("update_subtask", || self.inner.update_subtask(key, fields))
    }

    fn transition_status(&self, key: &IssueKey, status: Status) -> Result<(), TrackerError> {
        self.governor
            .call("transition_status", || self.inner.transition_status(key, status))
    }

    fn add_comment(&self, key: &IssueKey, body: &str) -> Result<String, TrackerError> {
        self.governor
            .call("add_comment", || self.inner.add_comment(key, body))
    }

    fn delete_issue(&self, key: &IssueKey) -> Result<(), TrackerError> {
        self.governor
            .call("delete_issue", || self.inner.delete_issue(key))
    }

    fn delete_comment(&self, key: &IssueKey, comment_id: &str) -> Result<(), TrackerError> {
        self.governor
            .call("delete_comment", || self.inner.delete_comment(key, comment_id))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use epicsync_core::MemoryTracker;

    fn manual() -> Arc<ManualClock> {
        Arc::new(ManualClock::new())
    }

    fn governor(clock: Arc<ManualClock>, capacity: u32, attempts: u32) -> Governor {
        Governor::new(
            TokenBucket::new(capacity, Duration::from_secs(1), clock.clone()),
            RetryPolicy::new(
                attempts,
                Duration::from_millis(100),
                Duration::from_secs(5),
                0.0,
            ),
            clock,
        )
    }

    #[test]
    fn bucket_refuses_beyond_capacity_within_period() {
        let clock = manual();
        let bucket = TokenBucket::new(2, Duration::from_secs(1), clock.clone());
        assert!(bucket.try_acquire().is_ok());
        clock.advance(Duration::from_millis(300));
        assert!(bucket.try_acquire().is_ok());
        assert_eq!(bucket.try_acquire(), Err(Duration::from_millis(700)));
        clock.advance(Duration::from_millis(700));
        assert!(bucket.try_acquire().is_ok());
        assert_eq!(bucket.try_acquire(), Err(Duration::from_millis(300)));
    }

    #[test]
    fn acquire_waits_for_oldest_token() {
        let clock = manual();
        let bucket = TokenBucket::new(1, Duration::from_secs(1), clock.clone());
        assert_eq!(bucket.acquire(), 0);
        assert_eq!(bucket.acquire(), 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(3), 0.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(60), 0.2)
                .with_seed(7);
        for _ in 0..100 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200), "{d:?}");
        }
    }

    #[test]
    fn transient_error_is_retried_once() {
        let clock = manual();
        let gov = governor(clock.clone(), 100, 4);
        let tracker = MemoryTracker::new("PROJ");
        tracker.fail_next("fetch_epic_children", TrackerError::rate_limited());

        let governed = GovernedTracker::new(&tracker, &gov);
        let result = governed.fetch_epic_children(&IssueKey::from("PROJ-1"));

        assert!(result.is_ok());
        assert_eq!(gov.stats().retries, 1);
        assert_eq!(gov.stats().calls, 2);
        assert_eq!(tracker.calls("fetch_epic_children"), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn permanent_error_fails_immediately() {
        let gov = governor(manual(), 100, 4);
        let tracker = MemoryTracker::new("PROJ");
        tracker.fail_next("fetch_issue", TrackerError::Auth("expired".into()));
        let governed = GovernedTracker::new(&tracker, &gov);
        let err = governed.fetch_issue(&IssueKey::from("PROJ-1")).unwrap_err();
        assert!(matches!(err, TrackerError::Auth(_)));
        assert_eq!(gov.stats().retries, 0);
        assert_eq!(tracker.calls("fetch_issue"), 1);
    }

    #[test]
    fn attempts_are_capped() {
        let gov = governor(manual(), 100, 3);
        let tracker = MemoryTracker::new("PROJ");
        for _ in 0..5 {
            tracker.fail_next("fetch_issue", TrackerError::api(503, "down"));
        }
        let governed = GovernedTracker::new(&tracker, &gov);
        assert!(governed.fetch_issue(&IssueKey::from("PROJ-1")).is_err());
        assert_eq!(tracker.calls("fetch_issue"), 3);
        assert_eq!(gov.stats().retries, 2);
    }

    #[test]
    fn throttled_waits_are_counted() {
        let clock = manual();
        let gov = governor(clock.clone(), 1, 1);
        let tracker = MemoryTracker::new("PROJ");
        let governed = GovernedTracker::new(&tracker, &gov);
        let epic = IssueKey::from("PROJ-1");
        governed.fetch_epic_children(&epic).unwrap();
        governed.fetch_epic_children(&epic).unwrap();
        assert_eq!(gov.stats().throttled, 1);
        assert_eq!(clock.now(), Duration::from_secs(1));
    }
}
