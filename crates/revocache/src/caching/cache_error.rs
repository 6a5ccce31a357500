use std::time::Duration;

use thiserror::Error;

/// An error that happens while computing a response.
///
/// Failures propagate verbatim to every caller awaiting the same computation;
/// the cache never wraps them in a cache-specific error. A failed first
/// computation is not retained (see
/// [`MemoCache::get_or_compute`](super::MemoCache::get_or_compute)), so the
/// next caller retries instead of replaying a stale error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested entity does not exist at the data source.
    #[error("not found")]
    NotFound,
    /// The data source rejected the request due to missing permissions.
    ///
    /// The attached string contains the data source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The computation did not finish in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The data source could not be reached or answered with a server error.
    ///
    /// The attached string contains the data source's response.
    #[error("upstream request failed: {0}")]
    Upstream(String),
    /// An unexpected error in the caching layer itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A low-cardinality tag describing this error in metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::PermissionDenied(_) => "permission-denied",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::InternalError => "internal",
        }
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the
/// reason why the response could not be computed or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
