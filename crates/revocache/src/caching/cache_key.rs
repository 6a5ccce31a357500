use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The key under which a response is cached.
///
/// A key is unique per `(target, method, serialized arguments)` tuple and
/// immutable once constructed. Equality and hashing use the sha-256 digest of
/// the human-readable metadata, so the metadata written into the builder must
/// be **stable** or the cache will be reused badly.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    raw: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for a call to `method` on `target` with the
    /// given serialized arguments.
    pub fn from_parts(target: &str, method: &str, args: &str) -> Self {
        let mut builder = Self::builder(target, method);
        builder.write_args(args).expect("writing to a String");
        builder.build()
    }

    /// Create a [`CacheKeyBuilder`] seeded with the call target and method.
    pub fn builder(target: &str, method: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            raw: format!("target: {target}\nmethod: {method}\n"),
        }
    }

    /// Returns the human-readable metadata that forms the basis of this key.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// A short hex fingerprint of the key, for log lines.
    pub fn fingerprint(&self) -> String {
        let mut out = String::with_capacity(16);
        for b in &self.hash[..8] {
            out.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        out
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder { raw: key.into() }.build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the
/// intention of it is to accept human readable, but most importantly
/// **stable**, input. This input is then hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    raw: String,
}

impl CacheKeyBuilder {
    /// Writes the serialized call arguments into the key.
    pub fn write_args(&mut self, args: &str) -> fmt::Result {
        self.raw.write_fmt(format_args!("args: {args}\n"))
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.raw);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        CacheKey {
            raw: self.raw.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.raw.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality() {
        let a = CacheKey::from_parts("users", "get", r#"{"id":42}"#);
        let b = CacheKey::from_parts("users", "get", r#"{"id":42}"#);
        let c = CacheKey::from_parts("users", "get", r#"{"id":43}"#);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_key_metadata() {
        let key = CacheKey::from_parts("users", "get", r#"{"id":42}"#);
        assert_eq!(key.raw(), "target: users\nmethod: get\nargs: {\"id\":42}\n");
        assert_eq!(key.fingerprint().len(), 16);
    }

    #[test]
    fn test_builder_extra_metadata() {
        let mut builder = CacheKey::builder("users", "get");
        builder.write_str("tenant: acme\n").unwrap();
        builder.write_args("{}").unwrap();
        let key = builder.build();

        assert_ne!(key, CacheKey::from_parts("users", "get", "{}"));
        assert!(key.raw().contains("tenant: acme"));
    }
}
