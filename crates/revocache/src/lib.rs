//! An asynchronous, self-refreshing in-memory response cache with
//! revocation-aware invalidation.
//!
//! The crate consists of three tightly coupled pieces:
//!
//! - [`caching::MemoCache`], a single-flight memoizing cache that deduplicates
//!   concurrent computations and refreshes entries ahead of their expiration,
//! - [`revocation::RecentRevocationTracker`], which closes the race between a
//!   fetch that is in flight and a revoke message that arrives before the
//!   fetched response is cached,
//! - [`revocation::RevokeRegistry`], which lets cached consumers subscribe to
//!   revoke notifications through weak handles, so the registry never keeps a
//!   subscriber alive.
//!
//! Cache coherence across a fleet is achieved by every process independently
//! receiving the same external revoke messages; there is no cross-process
//! protocol in here.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod logging;
pub mod revocation;
mod utils;

#[cfg(test)]
pub(crate) mod test;

pub use caching::{
    CacheEntry, CacheError, CacheItemRequest, CacheKey, CacheKeyBuilder, MemoCache,
};
pub use clock::{SharedClock, SystemClock, UtcClock};
pub use config::{CachePolicy, Config, RevocationConfig, RuntimeSettings};
pub use revocation::{
    PendingRequest, RecentRevocationTracker, RevocationService, RevokeRegistry, RevokeSubscriber,
};
