//! Helpers for testing.
//!
//! When writing tests, keep the following points in mind:
//!
//! - In every test, call [`test::setup`](setup) to set up the tracing
//!   subscriber.
//! - Tests that exercise time-dependent behavior should use a [`ManualClock`]
//!   instead of sleeping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::UtcClock;
use crate::utils::chrono_duration;

/// Setup the test environment.
///
/// - Initializes logs: The logger only captures logs from this crate and mutes
///   all other logs.
pub(crate) fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("revocache=trace")
        .with_test_writer()
        .pretty()
        .try_init()
        .ok();
}

/// A clock that only moves when the test tells it to.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += chrono_duration(by);
    }
}

impl UtcClock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
