//! Abstraction over wall-clock time so that background loops and age-based
//! decisions can be driven deterministically in tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt::Debug,
    ops::{Add, Sub},
    sync::Arc,
    time::Duration,
};

/// An instant in time, nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Construct from milliseconds since the unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Elapsed time since `earlier`, or `None` if `earlier` is in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// `self + duration`, or `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(duration).map(Self)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("time overflow")
    }
}

impl Sub<Self> for Time {
    type Output = chrono::Duration;

    fn sub(self, rhs: Self) -> chrono::Duration {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] that only advances when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a mock provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the clock by `duration` and return the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_round_trip() {
        let t = Time::from_timestamp_nanos(3_000_000_042);
        assert_eq!(t.timestamp_nanos(), 3_000_000_042);
        assert_eq!(Time::from_timestamp_millis(1500).timestamp_nanos(), 1_500_000_000);
    }

    #[test]
    fn duration_since_saturates_backwards() {
        let earlier = Time::from_timestamp_nanos(100);
        let later = Time::from_timestamp_nanos(350);
        assert_eq!(
            later.checked_duration_since(earlier),
            Some(Duration::from_nanos(250))
        );
        assert_eq!(earlier.checked_duration_since(later), None);
    }

    #[test]
    fn mock_provider_advances_on_demand() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), provider.now());

        provider.inc(Duration::from_secs(1));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(1_000_000_000));

        provider.set(Time::from_timestamp_nanos(42));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(42));
    }

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }
}
