use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::{SharedClock, SystemClock};
use crate::config::RuntimeSettings;
use crate::utils::chrono_duration;

/// Watermark fallback when no outgoing request is pending: "now" minus this
/// grace period, so a just-enqueued request that is not yet visible cannot be
/// raced past.
const NO_PENDING_GRACE: Duration = Duration::from_secs(5);

/// Outgoing requests pending longer than this indicate a bug upstream (a
/// computation that never settles). They are logged and dropped so they do
/// not pin the watermark forever.
const STUCK_REQUEST_CEILING: Duration = Duration::from_secs(600);

/// Guard held by the issuer of an outgoing request.
///
/// Dropping the guard (on completion, cancellation or panic unwind) marks the
/// request as no longer pending.
pub struct PendingRequest {
    _done: Arc<()>,
}

struct OutgoingRequest {
    done: Weak<()>,
    sent_at: DateTime<Utc>,
}

struct RevokeArrival {
    key: Arc<str>,
    revoked_at: DateTime<Utc>,
}

/// Tracks keys that were revoked "recently" relative to in-flight requests.
///
/// This closes the race where a read is issued at T1, a revoke for the same
/// key arrives at T2 with T1 < T2 < completion of the read, and the read's
/// now-stale result would otherwise be cached after the revoke. Nothing would
/// ever revoke it again.
///
/// All timestamps are UTC by construction ([`DateTime<Utc>`]); timestamps
/// outside the configured plausibility window are programmer errors and
/// panic.
pub struct RecentRevocationTracker {
    settings: Arc<RuntimeSettings>,
    clock: SharedClock,
    /// Revocation key -> latest observed revoke time.
    ///
    /// Lock order: never acquire `arrivals` while holding this lock.
    /// `cleanup` does take this lock while holding `arrivals`.
    index: RwLock<HashMap<Arc<str>, DateTime<Utc>>>,
    /// FIFO of revoke arrivals, drained by `cleanup` up to the watermark.
    arrivals: Mutex<VecDeque<RevokeArrival>>,
    /// Outgoing requests in registration order, which is not necessarily
    /// `sent_at` order.
    pending: Mutex<VecDeque<OutgoingRequest>>,
}

impl RecentRevocationTracker {
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: Arc<RuntimeSettings>, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            index: Default::default(),
            arrivals: Default::default(),
            pending: Default::default(),
        }
    }

    /// Registers a request that might populate a cache.
    ///
    /// The send time of the oldest still-pending request forms the watermark
    /// below which old revoke records are safe to drop. The returned guard
    /// must be held until the request settles.
    pub fn register_outgoing_request(&self, sent_at: DateTime<Utc>) -> PendingRequest {
        let handle = Arc::new(());
        if self.settings.use_recent_revocations() {
            self.validate_timestamp("sent_at", sent_at);
            let mut pending = self.pending.lock().unwrap();
            pending.push_back(OutgoingRequest {
                done: Arc::downgrade(&handle),
                sent_at,
            });
            metric!(gauge("revocations.pending_requests") = pending.len() as u64);
        }
        PendingRequest { _done: handle }
    }

    /// Records that `key` was revoked at `revoked_at`.
    ///
    /// Monotonic per key: the stored time only ever moves forward, regardless
    /// of the order in which revoke messages arrive.
    ///
    /// # Panics
    ///
    /// Panics on an empty key or a timestamp outside the plausibility window;
    /// both indicate a bug in the calling code.
    pub fn register_revoke(&self, key: &str, revoked_at: DateTime<Utc>) {
        if !self.settings.use_recent_revocations() {
            return;
        }
        assert!(!key.is_empty(), "revocation key must not be empty");
        self.validate_timestamp("revoked_at", revoked_at);

        // Fast path without the write lock: re-deliveries usually carry a
        // timestamp we have already recorded.
        {
            let index = self.index.read().unwrap();
            if index.get(key).is_some_and(|&stored| stored >= revoked_at) {
                return;
            }
        }

        let key: Arc<str> = key.into();
        let advanced = {
            let mut index = self.index.write().unwrap();
            match index.get_mut(&key) {
                // Re-check under the write lock, a concurrent update may have
                // won the race with a newer timestamp.
                Some(stored) if *stored >= revoked_at => false,
                Some(stored) => {
                    *stored = revoked_at;
                    true
                }
                None => {
                    index.insert(Arc::clone(&key), revoked_at);
                    true
                }
            }
        };

        if advanced {
            metric!(counter("revocations.recorded") += 1);
            let mut arrivals = self.arrivals.lock().unwrap();
            arrivals.push_back(RevokeArrival { key, revoked_at });
            metric!(gauge("revocations.arrival_queue") = arrivals.len() as u64);
        }
    }

    /// Returns the recorded revoke time for `key` if it is at or after
    /// `compare_at`.
    ///
    /// `compare_at` is the time the caller captured before its request
    /// started; a `None` result means the response is safe to cache.
    ///
    /// # Panics
    ///
    /// Panics on an empty key or a `compare_at` outside the plausibility
    /// window; both indicate a bug in the calling code.
    pub fn was_recently_revoked(
        &self,
        key: &str,
        compare_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !self.settings.use_recent_revocations() {
            return None;
        }
        assert!(!key.is_empty(), "revocation key must not be empty");
        self.validate_timestamp("compare_at", compare_at);

        let index = self.index.read().unwrap();
        index
            .get(key)
            .copied()
            .filter(|&revoked_at| revoked_at >= compare_at)
    }

    /// Drops revoke records that can no longer race with any in-flight
    /// request.
    ///
    /// The watermark is the send time of the oldest still-pending outgoing
    /// request. A queued arrival older than the watermark only removes the
    /// index record if the record is itself older than the watermark; it may
    /// have been refreshed by a newer revoke since the queue entry was
    /// produced.
    pub fn cleanup(&self) {
        if !self.settings.use_recent_revocations() {
            return;
        }
        let now = self.clock.utc_now();
        let watermark = self.pending_watermark(now);

        let mut removed: i64 = 0;
        let mut arrivals = self.arrivals.lock().unwrap();
        while let Some(front) = arrivals.front() {
            if front.revoked_at >= watermark {
                break;
            }
            let arrival = arrivals.pop_front().expect("front was just observed");
            let mut index = self.index.write().unwrap();
            if index
                .get(&arrival.key)
                .is_some_and(|&stored| stored < watermark)
            {
                index.remove(&arrival.key);
                removed += 1;
            }
        }
        metric!(gauge("revocations.arrival_queue") = arrivals.len() as u64);
        drop(arrivals);

        if removed > 0 {
            metric!(counter("revocations.expired") += removed);
            tracing::debug!(removed, %watermark, "dropped revoke records older than the watermark");
        }
        metric!(gauge("revocations.index_size") = self.index.read().unwrap().len() as u64);
    }

    /// Spawns the self-rescheduling cleanup loop.
    ///
    /// The interval is re-read from the settings on every tick. A panicking
    /// tick is logged and the loop continues; cancellation lets the current
    /// iteration finish.
    pub fn spawn_cleanup_loop(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = tracker.settings.cleanup_interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if panic::catch_unwind(AssertUnwindSafe(|| tracker.cleanup())).is_err() {
                    tracing::error!("revocation tracker cleanup tick panicked");
                }
            }
            tracing::debug!("revocation tracker cleanup loop exited");
        })
    }

    /// The number of revoke records currently held.
    pub fn record_count(&self) -> usize {
        self.index.read().unwrap().len()
    }

    fn pending_watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut pending = self.pending.lock().unwrap();
        // Requests are queued in lock-acquisition order with caller-supplied
        // send times, so the queue is not necessarily ordered by `sent_at`;
        // the watermark is the minimum over all still-pending entries.
        let mut watermark: Option<DateTime<Utc>> = None;
        pending.retain(|request| {
            if request.done.strong_count() == 0 {
                // Completed, no longer pins the watermark.
                return false;
            }
            if now.signed_duration_since(request.sent_at) > chrono_duration(STUCK_REQUEST_CEILING)
            {
                tracing::warn!(
                    sent_at = %request.sent_at,
                    "outgoing request never completed, dropping it from the watermark computation"
                );
                return false;
            }
            watermark = Some(watermark.map_or(request.sent_at, |w| w.min(request.sent_at)));
            true
        });
        metric!(gauge("revocations.pending_requests") = pending.len() as u64);
        drop(pending);

        watermark.unwrap_or_else(|| now - chrono_duration(NO_PENDING_GRACE))
    }

    fn validate_timestamp(&self, field: &str, timestamp: DateTime<Utc>) {
        let now = self.clock.utc_now();
        let drift = chrono_duration(self.settings.max_clock_drift());
        assert!(
            timestamp >= now - drift && timestamp <= now + drift,
            "{field} is implausible: {timestamp} is more than {:?} away from now ({now})",
            self.settings.max_clock_drift(),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::config::RevocationConfig;
    use crate::test::{self, ManualClock};

    use super::*;

    fn tracker_at(
        start: DateTime<Utc>,
    ) -> (
        Arc<RecentRevocationTracker>,
        Arc<ManualClock>,
        Arc<RuntimeSettings>,
    ) {
        test::setup();
        let settings = RuntimeSettings::new(&RevocationConfig::default());
        let clock = ManualClock::new(start);
        let tracker = Arc::new(RecentRevocationTracker::with_clock(
            Arc::clone(&settings),
            clock.clone(),
        ));
        (tracker, clock, settings)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_monotonic_revoke_time() {
        let (tracker, _clock, _settings) = tracker_at(t0());

        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(5));
        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(3));
        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(8));
        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(3));

        assert_eq!(
            tracker.was_recently_revoked("user:42", t0()),
            Some(t0() + chrono::Duration::seconds(8))
        );
    }

    #[test]
    fn test_revoke_race_window() {
        let (tracker, clock, _settings) = tracker_at(t0());

        let request_started = t0();
        let _pending = tracker.register_outgoing_request(request_started);

        clock.advance(Duration::from_secs(1));
        let revoked_at = t0() + chrono::Duration::seconds(1);
        tracker.register_revoke("user:42", revoked_at);

        // A request started before the revoke sees itself as possibly stale.
        assert_eq!(
            tracker.was_recently_revoked("user:42", request_started),
            Some(revoked_at)
        );
        // A request started after the revoke does not.
        assert_eq!(
            tracker.was_recently_revoked("user:42", revoked_at + chrono::Duration::seconds(1)),
            None
        );
        // Other keys are unaffected.
        assert_eq!(tracker.was_recently_revoked("user:43", request_started), None);
    }

    #[test]
    fn test_cleanup_removes_old_records() {
        let (tracker, clock, _settings) = tracker_at(t0());

        tracker.register_revoke("user:42", t0());
        let pending = tracker.register_outgoing_request(t0());

        // While the request is pending, the record must survive cleanup.
        clock.advance(Duration::from_secs(60));
        tracker.cleanup();
        assert!(tracker.was_recently_revoked("user:42", t0()).is_some());

        // Once it completes and the grace period passes, the record goes.
        drop(pending);
        tracker.cleanup();
        assert_eq!(tracker.was_recently_revoked("user:42", t0()), None);
        assert_eq!(tracker.record_count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_refreshed_records() {
        let (tracker, clock, _settings) = tracker_at(t0());

        tracker.register_revoke("user:42", t0());

        // The record is refreshed by a newer revoke before cleanup runs. The
        // stale arrival-queue entry must not remove it.
        clock.advance(Duration::from_secs(60));
        let newer = t0() + chrono::Duration::seconds(60);
        tracker.register_revoke("user:42", newer);

        clock.advance(Duration::from_secs(1));
        tracker.cleanup();
        assert_eq!(tracker.was_recently_revoked("user:42", t0()), Some(newer));
    }

    #[test]
    fn test_cleanup_watermark_pinned_by_oldest_pending() {
        let (tracker, clock, _settings) = tracker_at(t0());

        let _oldest = tracker.register_outgoing_request(t0());
        clock.advance(Duration::from_secs(30));
        let newer = tracker.register_outgoing_request(t0() + chrono::Duration::seconds(30));
        drop(newer);

        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(30));
        clock.advance(Duration::from_secs(60));

        // The oldest request is still pending, so nothing may be dropped.
        tracker.cleanup();
        assert!(tracker.was_recently_revoked("user:42", t0()).is_some());
    }

    #[test]
    fn test_cleanup_watermark_ignores_queue_order() {
        let (tracker, clock, _settings) = tracker_at(t0());

        // Registration order does not match send order: the older request
        // lands behind the newer one in the queue.
        let _newer = tracker.register_outgoing_request(t0() + chrono::Duration::seconds(30));
        let _older = tracker.register_outgoing_request(t0());

        tracker.register_revoke("user:42", t0() + chrono::Duration::seconds(10));
        clock.advance(Duration::from_secs(60));
        tracker.cleanup();

        // The revoke still races the older pending request and must survive.
        assert_eq!(
            tracker.was_recently_revoked("user:42", t0()),
            Some(t0() + chrono::Duration::seconds(10))
        );
    }

    #[test]
    fn test_cleanup_drops_stuck_requests() {
        let (tracker, clock, _settings) = tracker_at(t0());

        // Held alive for the whole test, simulating a computation that never
        // settles.
        let _stuck = tracker.register_outgoing_request(t0());
        tracker.register_revoke("user:42", t0());

        // RuntimeSettings::max_clock_drift defaults to 1h, stay within it.
        clock.advance(STUCK_REQUEST_CEILING + Duration::from_secs(60));
        tracker.cleanup();

        // The stuck request no longer pins the watermark.
        assert_eq!(tracker.record_count(), 0);
    }

    #[test]
    fn test_disabled_tracker_is_a_noop() {
        let (tracker, _clock, settings) = tracker_at(t0());
        settings.set_use_recent_revocations(false);

        tracker.register_revoke("user:42", t0());
        assert_eq!(tracker.was_recently_revoked("user:42", t0()), None);
        assert_eq!(tracker.record_count(), 0);

        // Re-enabling starts from a clean slate without a restart.
        settings.set_use_recent_revocations(true);
        tracker.register_revoke("user:42", t0());
        assert!(tracker.was_recently_revoked("user:42", t0()).is_some());
    }

    #[test]
    #[should_panic(expected = "revocation key must not be empty")]
    fn test_empty_key_panics() {
        let (tracker, _clock, _settings) = tracker_at(t0());
        tracker.register_revoke("", t0());
    }

    #[test]
    #[should_panic(expected = "revoked_at is implausible")]
    fn test_implausible_timestamp_panics() {
        let (tracker, _clock, _settings) = tracker_at(t0());
        tracker.register_revoke("user:42", t0() + chrono::Duration::days(2));
    }

    #[test]
    #[should_panic(expected = "compare_at is implausible")]
    fn test_implausible_compare_at_panics() {
        let (tracker, _clock, _settings) = tracker_at(t0());
        tracker.was_recently_revoked("user:42", t0() - chrono::Duration::days(2));
    }
}
