use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A UTC wall-clock source.
///
/// Every timestamp handled by this crate is UTC; the clock is injectable so
/// refresh and revoke timing logic can be tested deterministically.
pub trait UtcClock: Send + Sync + 'static {
    fn utc_now(&self) -> DateTime<Utc>;
}

/// A shared handle to a [`UtcClock`].
pub type SharedClock = Arc<dyn UtcClock>;

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl UtcClock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
