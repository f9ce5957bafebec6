//! Time abstractions for testable scheduling.
//!
//! Backoff deadlines, claim timestamps and stale-claim cutoffs all read the
//! injected [`Clock`] so tests can drive time deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject a `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`, in tests this
    /// advances virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock with microsecond resolution.
///
/// Microseconds match PostgreSQL `TIMESTAMPTZ` precision, so timestamps
/// written through a test clock compare equal after a database round trip.
/// Clones share the same time source.
#[derive(Debug, Clone)]
pub struct TestClock {
    micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Sets the clock to `time`. Jumping backwards is allowed.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.micros.store(time.timestamp_micros(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::Acquire))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now() - start, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_clock_starts_at_given_time() {
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_clock_jump() {
        let clock = TestClock::new();
        let target = DateTime::from_timestamp(2_000, 0).unwrap();

        clock.jump_to(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), other.now());
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_without_waiting() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now() - start, chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn real_clock_sleeps() {
        let clock = RealClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_millis(10)).await;

        assert!(clock.now() >= start);
    }
}
