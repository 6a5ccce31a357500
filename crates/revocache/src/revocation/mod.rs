//! # Revocation-aware invalidation
//!
//! Two cooperating pieces keep cached responses honest in the face of
//! out-of-band revoke messages:
//!
//! - The [`RecentRevocationTracker`] remembers which keys were revoked
//!   recently enough to race with an in-flight computation. The cache checks
//!   it before retaining a freshly computed value, closing the window where a
//!   response read before a revoke would be cached after it.
//! - The [`RevokeRegistry`] fans a revoke out to interested subscribers. It
//!   holds subscribers weakly and never keeps them alive.
//!
//! The [`RevocationService`] owns both, wires an incoming revoke message into
//! them in the right order, and runs their periodic cleanup loops. At most
//! one service may be live per process, matching the process-wide revoke
//! message stream it consumes.

mod registry;
mod tracker;

pub use registry::{RevokeRegistry, RevokeSubscriber};
pub use tracker::{PendingRequest, RecentRevocationTracker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future;
use tokio_util::sync::CancellationToken;

use crate::clock::{SharedClock, SystemClock};
use crate::config::{RevocationConfig, RuntimeSettings};

/// Whether a [`RevocationService`] is currently live in this process.
static SERVICE_LIVE: AtomicBool = AtomicBool::new(false);

/// Owns the revocation tracker and registry and their cleanup loops.
///
/// Must be constructed on a tokio runtime. Dropping the service stops the
/// cleanup loops; [`shutdown`](Self::shutdown) additionally waits for them to
/// exit.
pub struct RevocationService {
    settings: Arc<RuntimeSettings>,
    tracker: Arc<RecentRevocationTracker>,
    registry: Arc<RevokeRegistry>,
    token: CancellationToken,
    loops: Vec<tokio::task::JoinHandle<()>>,
}

impl RevocationService {
    pub fn new(config: &RevocationConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates the service, failing if another one is already live.
    pub fn with_clock(config: &RevocationConfig, clock: SharedClock) -> Result<Self> {
        if SERVICE_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("a revocation service is already running in this process");
        }

        let settings = RuntimeSettings::new(config);
        let tracker = Arc::new(RecentRevocationTracker::with_clock(
            Arc::clone(&settings),
            clock,
        ));
        let registry = Arc::new(RevokeRegistry::new(Arc::clone(&settings)));

        let token = CancellationToken::new();
        let loops = vec![
            tracker.spawn_cleanup_loop(token.clone()),
            registry.spawn_cleanup_loop(token.clone()),
        ];

        Ok(Self {
            settings,
            tracker,
            registry,
            token,
            loops,
        })
    }

    pub fn tracker(&self) -> &Arc<RecentRevocationTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<RevokeRegistry> {
        &self.registry
    }

    /// Settings shared with the tracker and registry; toggles take effect on
    /// the next access or cleanup tick.
    pub fn settings(&self) -> &Arc<RuntimeSettings> {
        &self.settings
    }

    /// Processes one incoming revoke message.
    ///
    /// The tracker is updated before subscribers are notified, so a
    /// subscriber reacting to the notification by recomputing already sees
    /// the revoke record.
    pub fn on_revoke_message(&self, key: &str, revoked_at: DateTime<Utc>) {
        self.tracker.register_revoke(key, revoked_at);
        self.registry.on_external_revoke(key);
    }

    /// Stops the cleanup loops and waits up to `grace` for them to exit.
    pub async fn shutdown(mut self, grace: Duration) {
        self.token.cancel();
        let loops = std::mem::take(&mut self.loops);
        if tokio::time::timeout(grace, future::join_all(loops))
            .await
            .is_err()
        {
            tracing::warn!("revocation cleanup loops did not exit within the shutdown grace");
        }
    }
}

impl Drop for RevocationService {
    fn drop(&mut self) {
        self.token.cancel();
        SERVICE_LIVE.store(false, Ordering::SeqCst);
    }
}
