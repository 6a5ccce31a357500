//! # The memoizing cache
//!
//! The in-memory caching layer does request coalescing (deduplicating
//! concurrent accesses per key) and refresh-ahead: an access to an entry
//! whose refresh deadline has passed kicks off exactly one background
//! recomputation while the accessor is served the existing value.
//!
//! A cache access goes through the following steps:
//! - The slot for the key is looked up, or atomically created on miss; every
//!   concurrent caller for the same key awaits the same shared computation.
//! - On hit, the refresh deadline is checked and a background refresh is
//!   started if it is due and none is running for that slot.
//! - On completion of a first computation, the result is retained unless it
//!   failed, or unless its revocation key was revoked while the computation
//!   was in flight (see [`crate::revocation`]).
//!
//! Size- and TTL-based eviction is delegated to the underlying bounded store;
//! the cache tolerates an entry disappearing between steps.
//!
//! ## Metrics
//!
//! Each metric is tagged with a `cache` field naming the cache instance:
//!
//! - `caches.access`: all accesses.
//! - `caches.miss`: accesses that created a fresh slot.
//! - `caches.hit`: accesses served by an already completed computation.
//! - `caches.joined`: accesses that joined a computation already in flight.
//! - `caches.computation.failed`: failed first computations (tagged `error`).
//! - `caches.in_flight`: gauge of currently running computations.
//! - `caches.refresh`: background refreshes, tagged
//!   `status = success|failed|discarded`.
//! - `caches.revoked_discard`: fresh values dropped because their key was
//!   revoked mid-flight.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! The caching layer deals in [`CacheEntry`]s, an alias for a [`Result`]
//! around a [`CacheError`]. Errors are propagated to every caller awaiting
//! the same computation, never wrapped in a cache-specific error.

mod cache_error;
mod cache_key;
mod memory;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use memory::{CacheItemRequest, MemoCache};
