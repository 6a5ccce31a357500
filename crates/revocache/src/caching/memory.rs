use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::clock::{SharedClock, SystemClock};
use crate::config::{CachePolicy, RuntimeSettings};
use crate::revocation::RecentRevocationTracker;
use crate::utils::{CallOnDrop, chrono_duration};

use super::{CacheEntry, CacheKey};

/// A handle to a (possibly still running) computation that every concurrent
/// caller for the same key awaits.
type SharedComputation<T> = Shared<BoxFuture<'static, CacheEntry<T>>>;

/// A request for a cacheable item.
///
/// The request carries everything needed to (re)compute the item, so the
/// cache can run the same computation again for background refreshes.
pub trait CacheItemRequest: Clone + Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Computes a fresh instance of this item.
    ///
    /// This is invoked once per cache miss and once per background refresh,
    /// never concurrently for the same key.
    fn compute(&self) -> BoxFuture<'static, CacheEntry<Self::Item>>;

    /// The revocation key guarding this item, if any.
    ///
    /// When set, and [`RuntimeSettings::dont_cache_recently_revoked`] is
    /// enabled, a freshly computed value is discarded from the cache if a
    /// revoke for this key arrived while the computation was in flight.
    fn revocation_key(&self) -> Option<String> {
        None
    }
}

/// The bookkeeping fields of a [`ValueSlot`].
///
/// Guarded by the slot mutex, which is only ever held for short critical
/// sections and never across the computation itself.
struct SlotState<T> {
    /// The most recently completed (or still running) computation.
    current: SharedComputation<T>,
    /// When the next access should trigger a background refresh.
    next_refresh_at: DateTime<Utc>,
    /// Whether a background refresh is currently running for this slot.
    refresh_in_flight: bool,
}

/// The unit of cached state for one key.
struct ValueSlot<T> {
    /// When the first computation for this slot was issued.
    ///
    /// This is the reference point for the "was this key revoked after my
    /// request started" check.
    requested_at: DateTime<Utc>,
    state: Mutex<SlotState<T>>,
}

/// One generation of the cache.
///
/// [`MemoCache::clear`] swaps the whole generation out; computations still
/// bound to an old generation write only into it, so their results are never
/// observable after a clear.
struct Generation<T: Clone + Send + Sync + 'static> {
    store: moka::sync::Cache<CacheKey, Arc<ValueSlot<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Generation<T> {
    fn new(name: &'static str, policy: &CachePolicy) -> Self {
        let store = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(policy.in_memory_capacity)
            .time_to_live(policy.expiration_time)
            .build();
        Self { store }
    }
}

/// An in-memory, keyed store of lazily computed values.
///
/// Internally deduplicates concurrent computations per key (single-flight)
/// and refreshes entries ahead of their expiration in the background, so
/// readers are never blocked on a recomputation of a value they already have.
pub struct MemoCache<R: CacheItemRequest> {
    name: &'static str,
    policy: CachePolicy,
    clock: SharedClock,
    settings: Arc<RuntimeSettings>,
    tracker: Option<Arc<RecentRevocationTracker>>,
    in_flight: Arc<AtomicI64>,
    generation: Mutex<Arc<Generation<R::Item>>>,
}

impl<R: CacheItemRequest> std::fmt::Debug for MemoCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("name", &self.name)
            .field("entries", &self.current_generation().store.entry_count())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl<R: CacheItemRequest> MemoCache<R> {
    /// Creates a cache without revocation awareness.
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self::with_clock(name, policy, Default::default(), None, Arc::new(SystemClock))
    }

    /// Creates a cache that consults the given tracker before retaining
    /// freshly computed values.
    pub fn with_revocations(
        name: &'static str,
        policy: CachePolicy,
        settings: Arc<RuntimeSettings>,
        tracker: Arc<RecentRevocationTracker>,
    ) -> Self {
        Self::with_clock(name, policy, settings, Some(tracker), Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: &'static str,
        policy: CachePolicy,
        settings: Arc<RuntimeSettings>,
        tracker: Option<Arc<RecentRevocationTracker>>,
        clock: SharedClock,
    ) -> Self {
        let generation = Mutex::new(Arc::new(Generation::new(name, &policy)));
        Self {
            name,
            policy,
            clock,
            settings,
            tracker,
            in_flight: Default::default(),
            generation,
        }
    }

    /// Computes an item, deduplicating the computation between concurrent
    /// requests for the same key.
    ///
    /// If the entry is due for a refresh, a background refresh is started
    /// (at most one per key) and the caller is served the existing value
    /// without waiting.
    ///
    /// # Errors
    ///
    /// A failing [`compute`](CacheItemRequest::compute) propagates its error
    /// to every caller awaiting the computation. A failed first computation
    /// is not retained.
    pub async fn get_or_compute(&self, request: R, key: CacheKey) -> CacheEntry<R::Item> {
        metric!(counter("caches.access") += 1, "cache" => self.name);

        let generation = self.current_generation();
        let now = self.clock.utc_now();

        // The store's atomic insert-if-absent decides the winner when two
        // callers race to create the first slot; the loser adopts the
        // winner's slot.
        let entry = generation
            .store
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(&request, &generation, &key, now));
        let is_miss = entry.is_fresh();
        let slot = entry.into_value();

        let (current, start_refresh) = {
            let mut state = slot.state.lock().unwrap();
            let refresh_due = !is_miss && now >= state.next_refresh_at && !state.refresh_in_flight;
            if refresh_due {
                state.refresh_in_flight = true;
            }
            (state.current.clone(), refresh_due)
        };

        if is_miss {
            metric!(counter("caches.miss") += 1, "cache" => self.name);
        } else if current.peek().is_some() {
            metric!(counter("caches.hit") += 1, "cache" => self.name);
        } else {
            metric!(counter("caches.joined") += 1, "cache" => self.name);
        }

        if start_refresh {
            self.spawn_refresh(
                request.clone(),
                key.clone(),
                Arc::clone(&generation),
                Arc::clone(&slot),
            );
        }

        current.await
    }

    /// Atomically swaps in an empty cache generation.
    ///
    /// Disposal of the old generation happens on a spawned task and never
    /// blocks the caller. Computations still in flight against the old
    /// generation complete normally, but their results are never stored in
    /// the new generation.
    pub fn clear(&self) {
        let fresh = Arc::new(Generation::new(self.name, &self.policy));
        let old = {
            let mut generation = self.generation.lock().unwrap();
            std::mem::replace(&mut *generation, fresh)
        };

        let name = self.name;
        tokio::spawn(async move {
            let entries = old.store.entry_count();
            drop(old);
            tracing::debug!(cache = name, entries, "disposed of cleared cache generation");
        });
    }

    /// The number of entries currently in the cache.
    pub fn entry_count(&self) -> u64 {
        let generation = self.current_generation();
        generation.store.run_pending_tasks();
        generation.store.entry_count()
    }

    fn current_generation(&self) -> Arc<Generation<R::Item>> {
        Arc::clone(&self.generation.lock().unwrap())
    }

    /// Builds a fresh slot whose computation starts when it is first polled.
    ///
    /// A detached settle task awaits the shared computation and does the
    /// post-completion bookkeeping (dropping failed first computations and
    /// values revoked mid-flight from the store). Tying that to a task
    /// instead of the creating caller's continuation means it runs even when
    /// that caller is cancelled and a joined caller finishes the computation,
    /// and that the computation always runs to completion once started.
    fn new_slot(
        &self,
        request: &R,
        generation: &Arc<Generation<R::Item>>,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Arc<ValueSlot<R::Item>> {
        let pending = self
            .tracker
            .as_ref()
            .map(|tracker| tracker.register_outgoing_request(now));
        let computation = request.compute();
        let name = self.name;
        let in_flight = Arc::clone(&self.in_flight);

        let current = async move {
            // Held until the computation settles, so the revocation tracker
            // sees this request as pending (including across panics).
            let _pending = pending;

            let count = in_flight.fetch_add(1, Ordering::Relaxed) + 1;
            metric!(gauge("caches.in_flight") = count.max(0) as u64, "cache" => name);
            let _guard = CallOnDrop::new(move || {
                let count = in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
                metric!(gauge("caches.in_flight") = count.max(0) as u64, "cache" => name);
            });

            computation.await
        }
        .boxed()
        .shared();

        let slot = Arc::new(ValueSlot {
            requested_at: now,
            state: Mutex::new(SlotState {
                current: current.clone(),
                next_refresh_at: now + chrono_duration(self.policy.refresh_time),
                refresh_in_flight: false,
            }),
        });

        let settle_slot = Arc::clone(&slot);
        let generation = Arc::clone(generation);
        let key = key.clone();
        let request = request.clone();
        let settings = Arc::clone(&self.settings);
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match current.await {
                Err(error) => {
                    metric!(
                        counter("caches.computation.failed") += 1,
                        "cache" => name,
                        "error" => error.metrics_tag(),
                    );
                    // The failed result is not retained, so the next caller
                    // retries from scratch instead of replaying a stale error.
                    remove_slot(&generation, &key, &settle_slot);
                }
                Ok(_) => {
                    let revoked = settings.dont_cache_recently_revoked()
                        && request.revocation_key().is_some_and(|revocation_key| {
                            tracker.as_ref().is_some_and(|tracker| {
                                tracker
                                    .was_recently_revoked(
                                        &revocation_key,
                                        settle_slot.requested_at,
                                    )
                                    .is_some()
                            })
                        });
                    if revoked {
                        metric!(counter("caches.revoked_discard") += 1, "cache" => name);
                        tracing::debug!(
                            key = %key.fingerprint(),
                            cache = name,
                            "discarding freshly computed value, its key was revoked mid-flight"
                        );
                        remove_slot(&generation, &key, &settle_slot);
                    }
                }
            }
        });

        slot
    }

    /// Runs one background refresh for the given slot.
    ///
    /// The caller must have set `refresh_in_flight` under the slot lock, which
    /// guarantees at most one refresh per slot at a time.
    fn spawn_refresh(
        &self,
        request: R,
        key: CacheKey,
        generation: Arc<Generation<R::Item>>,
        slot: Arc<ValueSlot<R::Item>>,
    ) {
        let name = self.name;
        let clock = Arc::clone(&self.clock);
        let policy = self.policy;
        let settings = Arc::clone(&self.settings);
        let tracker = self.tracker.clone();

        tracing::trace!(key = %key.fingerprint(), cache = name, "spawning background refresh");

        tokio::spawn(async move {
            let started_at = clock.utc_now();
            let _pending = tracker
                .as_ref()
                .map(|tracker| tracker.register_outgoing_request(started_at));

            // If the computation panics, clear the in-flight flag and apply
            // the failure backoff, so the slot does not get stuck
            // unrefreshable forever.
            let settled = Arc::new(AtomicBool::new(false));
            let panic_guard = {
                let slot = Arc::clone(&slot);
                let clock = Arc::clone(&clock);
                let settled = Arc::clone(&settled);
                let backoff = chrono_duration(policy.failed_refresh_delay);
                CallOnDrop::new(move || {
                    if settled.load(Ordering::Acquire) {
                        return;
                    }
                    let mut state = slot.state.lock().unwrap();
                    state.refresh_in_flight = false;
                    state.next_refresh_at = clock.utc_now() + backoff;
                    tracing::error!(cache = name, "background refresh panicked");
                })
            };

            let revocation_key = request.revocation_key();
            let result = request.compute().await;
            let now = clock.utc_now();

            let discard = result.is_ok()
                && settings.dont_cache_recently_revoked()
                && revocation_key.is_some_and(|revocation_key| {
                    tracker.as_ref().is_some_and(|tracker| {
                        tracker
                            .was_recently_revoked(&revocation_key, started_at)
                            .is_some()
                    })
                });

            let mut state = slot.state.lock().unwrap();
            state.refresh_in_flight = false;
            match result {
                Ok(value) if !discard => {
                    state.current = futures::future::ready(Ok(value)).boxed().shared();
                    state.next_refresh_at = now + chrono_duration(policy.refresh_time);
                    drop(state);
                    metric!(counter("caches.refresh") += 1, "status" => "success", "cache" => name);
                    // Re-insert to renew the store's TTL for the refreshed entry.
                    generation.store.insert(key, Arc::clone(&slot));
                }
                Ok(_) => {
                    state.next_refresh_at = now + chrono_duration(policy.failed_refresh_delay);
                    drop(state);
                    metric!(counter("caches.refresh") += 1, "status" => "discarded", "cache" => name);
                    tracing::debug!(
                        key = %key.fingerprint(),
                        cache = name,
                        "refreshed value was revoked mid-flight, keeping the previous value"
                    );
                }
                Err(error) => {
                    state.next_refresh_at = now + chrono_duration(policy.failed_refresh_delay);
                    drop(state);
                    metric!(counter("caches.refresh") += 1, "status" => "failed", "cache" => name);
                    tracing::warn!(
                        key = %key.fingerprint(),
                        cache = name,
                        error = %error,
                        "background refresh failed, keeping the previous value"
                    );
                }
            }

            settled.store(true, Ordering::Release);
            drop(panic_guard);
        });
    }
}

/// Removes `slot` from the store, unless a different slot has been inserted
/// under the key in the meantime.
fn remove_slot<T: Clone + Send + Sync + 'static>(
    generation: &Generation<T>,
    key: &CacheKey,
    slot: &Arc<ValueSlot<T>>,
) {
    if let Some(existing) = generation.store.get(key) {
        if Arc::ptr_eq(&existing, slot) {
            generation.store.invalidate(key);
        }
    }
}
