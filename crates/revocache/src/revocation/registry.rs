use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use crate::config::RuntimeSettings;

/// A consumer of revoke notifications.
///
/// Implementors are registered with the [`RevokeRegistry`] through a weak
/// handle: the registry is never the reason a subscriber stays alive.
pub trait RevokeSubscriber: Send + Sync + 'static {
    /// Invoked when a revoke message for one of the subscribed keys arrives.
    fn on_revoked(&self, key: &str);
}

/// Per-subscriber record in the registry.
struct RevocationContext {
    revokee: Weak<dyn RevokeSubscriber>,
    /// Span captured at registration time. The callback is dispatched inside
    /// it, so it observes the tracing scope that was current when the
    /// subscriber registered, not the revoke-delivery task's scope.
    span: tracing::Span,
}

impl Clone for RevocationContext {
    fn clone(&self) -> Self {
        Self {
            revokee: Weak::clone(&self.revokee),
            span: self.span.clone(),
        }
    }
}

impl RevocationContext {
    /// Identity is the underlying subscriber allocation.
    ///
    /// Comparing the thin data pointers keeps this well-defined whether or
    /// not the subscriber is still alive, and independent of vtable
    /// duplication across codegen units.
    fn is_same_subscriber(&self, other: &Weak<dyn RevokeSubscriber>) -> bool {
        std::ptr::addr_eq(Weak::as_ptr(&self.revokee), Weak::as_ptr(other))
    }

    fn is_dead(&self) -> bool {
        self.revokee.strong_count() == 0
    }
}

/// Maps revocation keys to weakly-held subscribers.
///
/// Per-key storage is a copy-on-write snapshot: every mutation builds a new
/// immutable collection and swaps it in under a narrow lock, so the
/// notify path iterates a consistent snapshot without holding any lock.
/// Dead subscribers are removed as a side effect of notification and by the
/// periodic cleanup sweep.
pub struct RevokeRegistry {
    settings: Arc<RuntimeSettings>,
    index: Mutex<HashMap<Arc<str>, Arc<Vec<RevocationContext>>>>,
}

impl RevokeRegistry {
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self {
            settings,
            index: Default::default(),
        }
    }

    /// Subscribes `subscriber` to revokes of the given keys.
    ///
    /// Registering the same (subscriber, key) pair twice is a no-op. The
    /// current tracing span is captured and the callback later runs inside
    /// it.
    ///
    /// # Panics
    ///
    /// Panics on an empty key.
    pub fn notify_on_revoke(&self, subscriber: &Arc<dyn RevokeSubscriber>, keys: &[&str]) {
        let weak = Arc::downgrade(subscriber);
        for &key in keys {
            assert!(!key.is_empty(), "revocation key must not be empty");

            let mut index = self.index.lock().unwrap();
            let entries = index.entry(Arc::from(key)).or_default();
            if entries.iter().any(|ctx| ctx.is_same_subscriber(&weak)) {
                continue;
            }
            let mut next = Vec::with_capacity(entries.len() + 1);
            next.extend(entries.iter().cloned());
            next.push(RevocationContext {
                revokee: Weak::clone(&weak),
                span: tracing::Span::current(),
            });
            *entries = Arc::new(next);
        }
    }

    /// Unsubscribes `subscriber` from the given keys.
    pub fn remove_notifications(&self, subscriber: &Arc<dyn RevokeSubscriber>, keys: &[&str]) {
        let weak = Arc::downgrade(subscriber);
        let mut index = self.index.lock().unwrap();
        for &key in keys {
            Self::remove_from_key(&mut index, key, &weak);
        }
    }

    /// Unsubscribes `subscriber` from every key it was registered under.
    ///
    /// Scans the full index; this is a rare "subscriber disposed" event, not
    /// a hot path.
    pub fn remove_all_notifications(&self, subscriber: &Arc<dyn RevokeSubscriber>) {
        let weak = Arc::downgrade(subscriber);
        let mut index = self.index.lock().unwrap();
        let keys: Vec<Arc<str>> = index.keys().cloned().collect();
        for key in keys {
            Self::remove_from_key(&mut index, &key, &weak);
        }
    }

    /// Delivers an external revoke for `key` to all live subscribers.
    ///
    /// Dead entries found along the way are removed. Each callback runs
    /// inside its captured span and is isolated with `catch_unwind`, so one
    /// failing subscriber never prevents the rest from being notified.
    pub fn on_external_revoke(&self, key: &str) {
        let snapshot = {
            let index = self.index.lock().unwrap();
            index.get(key).cloned()
        };
        let Some(snapshot) = snapshot else {
            return;
        };

        let mut saw_dead = false;
        let mut notified: i64 = 0;
        for ctx in snapshot.iter() {
            match ctx.revokee.upgrade() {
                None => saw_dead = true,
                Some(subscriber) => {
                    notified += 1;
                    let invoke =
                        AssertUnwindSafe(|| ctx.span.in_scope(|| subscriber.on_revoked(key)));
                    if panic::catch_unwind(invoke).is_err() {
                        metric!(counter("registry.notify_panicked") += 1);
                        tracing::error!(key, "revoke notification callback panicked");
                    }
                }
            }
        }
        metric!(counter("registry.notified") += notified);

        if saw_dead {
            self.sweep_key(key);
        }
    }

    /// Removes dead entries from every key's collection.
    pub fn cleanup(&self) {
        let keys: Vec<Arc<str>> = { self.index.lock().unwrap().keys().cloned().collect() };
        for key in keys {
            self.sweep_key(&key);
        }
        metric!(gauge("registry.subscriptions") = self.total_subscriptions() as u64);
    }

    /// Spawns the self-rescheduling cleanup loop.
    ///
    /// The interval is re-read from the settings on every tick, so interval
    /// changes take effect without a restart.
    pub fn spawn_cleanup_loop(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = registry.settings.cleanup_interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if panic::catch_unwind(AssertUnwindSafe(|| registry.cleanup())).is_err() {
                    tracing::error!("revoke registry cleanup tick panicked");
                }
            }
            tracing::debug!("revoke registry cleanup loop exited");
        })
    }

    /// The number of entries registered under `key`, dead or alive.
    pub fn subscription_count(&self, key: &str) -> usize {
        self.index
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |entries| entries.len())
    }

    /// The total number of entries across all keys, dead or alive.
    pub fn total_subscriptions(&self) -> usize {
        self.index
            .lock()
            .unwrap()
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Replaces `key`'s collection with a snapshot without dead entries.
    fn sweep_key(&self, key: &str) {
        let mut index = self.index.lock().unwrap();
        let Some(entries) = index.get(key) else {
            return;
        };
        if !entries.iter().any(|ctx| ctx.is_dead()) {
            return;
        }
        let live: Vec<_> = entries
            .iter()
            .filter(|ctx| !ctx.is_dead())
            .cloned()
            .collect();
        if live.is_empty() {
            index.remove(key);
        } else {
            index.insert(Arc::from(key), Arc::new(live));
        }
    }

    fn remove_from_key(
        index: &mut HashMap<Arc<str>, Arc<Vec<RevocationContext>>>,
        key: &str,
        subscriber: &Weak<dyn RevokeSubscriber>,
    ) {
        let Some(entries) = index.get(key) else {
            return;
        };
        let kept: Vec<_> = entries
            .iter()
            .filter(|ctx| !ctx.is_same_subscriber(subscriber))
            .cloned()
            .collect();
        if kept.len() == entries.len() {
            return;
        }
        if kept.is_empty() {
            index.remove(key);
        } else {
            index.insert(Arc::from(key), Arc::new(kept));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::config::RevocationConfig;
    use crate::test;

    use super::*;

    #[derive(Default)]
    struct TestSubscriber {
        invocations: Mutex<Vec<String>>,
        panic_on_call: bool,
    }

    impl TestSubscriber {
        fn panicking() -> Self {
            Self {
                invocations: Default::default(),
                panic_on_call: true,
            }
        }

        fn invocations(&self) -> Vec<String> {
            self.invocations.lock().unwrap().clone()
        }
    }

    impl RevokeSubscriber for TestSubscriber {
        fn on_revoked(&self, key: &str) {
            if self.panic_on_call {
                panic!("callback failure");
            }
            self.invocations.lock().unwrap().push(key.to_owned());
        }
    }

    fn registry() -> RevokeRegistry {
        test::setup();
        RevokeRegistry::new(RuntimeSettings::new(&RevocationConfig::default()))
    }

    fn subscriber() -> (Arc<TestSubscriber>, Arc<dyn RevokeSubscriber>) {
        let concrete = Arc::new(TestSubscriber::default());
        let erased: Arc<dyn RevokeSubscriber> = concrete.clone();
        (concrete, erased)
    }

    #[test]
    fn test_notify_delivers_key() {
        let registry = registry();
        let (concrete, erased) = subscriber();

        registry.notify_on_revoke(&erased, &["user:42", "tenant:7"]);
        registry.on_external_revoke("user:42");
        registry.on_external_revoke("unrelated");

        assert_eq!(concrete.invocations(), vec!["user:42"]);
    }

    #[test]
    fn test_idempotent_registration() {
        let registry = registry();
        let (concrete, erased) = subscriber();

        registry.notify_on_revoke(&erased, &["user:42"]);
        registry.notify_on_revoke(&erased, &["user:42"]);
        assert_eq!(registry.subscription_count("user:42"), 1);

        registry.on_external_revoke("user:42");
        assert_eq!(concrete.invocations(), vec!["user:42"]);
    }

    #[test]
    fn test_dead_subscriber_is_not_notified_and_swept() {
        let registry = registry();
        let (concrete, erased) = subscriber();

        registry.notify_on_revoke(&erased, &["user:42"]);
        assert_eq!(registry.subscription_count("user:42"), 1);

        drop(erased);
        drop(concrete);

        // The dead entry is removed as a side effect of the revoke.
        registry.on_external_revoke("user:42");
        assert_eq!(registry.subscription_count("user:42"), 0);
        assert_eq!(registry.total_subscriptions(), 0);
    }

    #[test]
    fn test_cleanup_sweeps_dead_entries() {
        let registry = registry();
        let (_alive_concrete, alive) = subscriber();
        let (dead_concrete, dead) = subscriber();

        registry.notify_on_revoke(&alive, &["user:42"]);
        registry.notify_on_revoke(&dead, &["user:42", "tenant:7"]);
        assert_eq!(registry.total_subscriptions(), 3);

        drop(dead);
        drop(dead_concrete);
        registry.cleanup();

        assert_eq!(registry.subscription_count("user:42"), 1);
        assert_eq!(registry.subscription_count("tenant:7"), 0);
        assert_eq!(registry.total_subscriptions(), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let registry = registry();
        let panicking: Arc<dyn RevokeSubscriber> = Arc::new(TestSubscriber::panicking());
        let (concrete, erased) = subscriber();

        registry.notify_on_revoke(&panicking, &["user:42"]);
        registry.notify_on_revoke(&erased, &["user:42"]);

        registry.on_external_revoke("user:42");
        assert_eq!(concrete.invocations(), vec!["user:42"]);
    }

    #[test]
    fn test_remove_notifications() {
        let registry = registry();
        let (concrete, erased) = subscriber();

        registry.notify_on_revoke(&erased, &["user:42", "tenant:7"]);
        registry.remove_notifications(&erased, &["user:42"]);

        registry.on_external_revoke("user:42");
        registry.on_external_revoke("tenant:7");
        assert_eq!(concrete.invocations(), vec!["tenant:7"]);
    }

    #[test]
    fn test_remove_all_notifications() {
        let registry = registry();
        let (concrete, erased) = subscriber();
        let (other_concrete, other) = subscriber();

        // Includes keys the caller doesn't know about.
        registry.notify_on_revoke(&erased, &["user:42", "tenant:7", "org:1"]);
        registry.notify_on_revoke(&other, &["user:42"]);

        registry.remove_all_notifications(&erased);
        assert_eq!(registry.total_subscriptions(), 1);

        registry.on_external_revoke("user:42");
        registry.on_external_revoke("org:1");
        assert!(concrete.invocations().is_empty());
        assert_eq!(other_concrete.invocations(), vec!["user:42"]);
    }
}
