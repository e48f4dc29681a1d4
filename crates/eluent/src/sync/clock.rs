//! Clock capability for timestamp and backoff control.
//!
//! The syncer and the claim retry loop never call `Utc::now()` or
//! `thread::sleep` directly; they go through a [`Clock`] so tests can drive
//! backoff and timestamp-dependent logic deterministically.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Provides the current UTC time and a blocking sleep.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC timestamp.
    fn now(&self) -> DateTime<Utc>;

    /// Block the calling thread for the given duration.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests: time only moves when advanced, and sleeps
/// are recorded instead of blocking.
#[cfg(test)]
#[derive(Debug)]
pub struct TestClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    slept: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
            slept: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap();
    }

    /// All durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        self.advance(duration);
    }
}
