use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level filter.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "revocache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Per-cache expiry and refresh tuning.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CachePolicy {
    /// Hard TTL after which an entry is evicted by the underlying bounded store.
    #[serde(with = "humantime_serde")]
    pub expiration_time: Duration,

    /// Entry age after which the next access triggers a background refresh.
    #[serde(with = "humantime_serde")]
    pub refresh_time: Duration,

    /// Backoff before a failed refresh is attempted again.
    ///
    /// Typically much shorter than `refresh_time`, so failures are retried
    /// sooner than successful refreshes without storming the data source.
    #[serde(with = "humantime_serde")]
    pub failed_refresh_delay: Duration,

    /// Maximum number of entries held in memory.
    pub in_memory_capacity: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(600),
            refresh_time: Duration::from_secs(60),
            failed_refresh_delay: Duration::from_secs(5),
            in_memory_capacity: 100_000,
        }
    }
}

/// Fine-tuning of the revocation tracker and the revoke-notification registry.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RevocationConfig {
    /// How often the background cleanup loops run.
    ///
    /// Re-read on every tick, so changes take effect without a restart.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Master switch for the recently-revoked tracker.
    ///
    /// When off, registrations are no-ops and lookups always report
    /// "not revoked".
    pub use_recent_revocations: bool,

    /// Whether freshly computed responses whose key was revoked mid-flight
    /// are discarded instead of cached.
    pub dont_cache_recently_revoked: bool,

    /// Tolerance window around "now" outside of which a supplied timestamp is
    /// treated as a programmer error.
    #[serde(with = "humantime_serde")]
    pub max_clock_drift: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(10),
            use_recent_revocations: true,
            dont_cache_recently_revoked: true,
            max_clock_drift: Duration::from_secs(3600),
        }
    }
}

/// The top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: Logging,
    /// Metrics settings.
    pub metrics: Metrics,
    /// Default policy for caches that do not configure their own.
    pub cache: CachePolicy,
    /// Revocation tracker / registry settings.
    pub revocation: RevocationConfig,
}

impl Config {
    /// Loads the configuration from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&source)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(de::Error::custom)
}

/// The live, runtime-toggleable view of [`RevocationConfig`].
///
/// The tracker reads these switches on every call and the cleanup loops
/// re-read the interval on every tick, which keeps a cheap bypass path that
/// does not require restarting the process.
#[derive(Debug)]
pub struct RuntimeSettings {
    cleanup_interval_ms: AtomicU64,
    use_recent_revocations: AtomicBool,
    dont_cache_recently_revoked: AtomicBool,
    max_clock_drift: Duration,
}

impl RuntimeSettings {
    pub fn new(config: &RevocationConfig) -> Arc<Self> {
        Arc::new(Self {
            cleanup_interval_ms: AtomicU64::new(config.cleanup_interval.as_millis() as u64),
            use_recent_revocations: AtomicBool::new(config.use_recent_revocations),
            dont_cache_recently_revoked: AtomicBool::new(config.dont_cache_recently_revoked),
            max_clock_drift: config.max_clock_drift,
        })
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_cleanup_interval(&self, interval: Duration) {
        self.cleanup_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn use_recent_revocations(&self) -> bool {
        self.use_recent_revocations.load(Ordering::Relaxed)
    }

    pub fn set_use_recent_revocations(&self, enabled: bool) {
        self.use_recent_revocations.store(enabled, Ordering::Relaxed);
    }

    pub fn dont_cache_recently_revoked(&self) -> bool {
        self.dont_cache_recently_revoked.load(Ordering::Relaxed)
    }

    pub fn set_dont_cache_recently_revoked(&self, enabled: bool) {
        self.dont_cache_recently_revoked
            .store(enabled, Ordering::Relaxed);
    }

    pub fn max_clock_drift(&self) -> Duration {
        self.max_clock_drift
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let config = RevocationConfig::default();
        Self {
            cleanup_interval_ms: AtomicU64::new(config.cleanup_interval.as_millis() as u64),
            use_recent_revocations: AtomicBool::new(config.use_recent_revocations),
            dont_cache_recently_revoked: AtomicBool::new(config.dont_cache_recently_revoked),
            max_clock_drift: config.max_clock_drift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.cache.refresh_time, Duration::from_secs(60));
        assert_eq!(config.revocation.cleanup_interval, Duration::from_secs(10));
        assert!(config.revocation.use_recent_revocations);
        assert_eq!(config.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_config_parsing() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            cache:
              refresh_time: 100ms
              failed_refresh_delay: 1s
              expiration_time: 10s
            revocation:
              cleanup_interval: 2s
              dont_cache_recently_revoked: false
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.cache.refresh_time, Duration::from_millis(100));
        assert_eq!(config.cache.expiration_time, Duration::from_secs(10));
        assert_eq!(config.revocation.cleanup_interval, Duration::from_secs(2));
        assert!(!config.revocation.dont_cache_recently_revoked);
    }

    #[test]
    fn test_runtime_settings_toggle() {
        let settings = RuntimeSettings::new(&RevocationConfig::default());
        assert!(settings.use_recent_revocations());

        settings.set_use_recent_revocations(false);
        assert!(!settings.use_recent_revocations());

        settings.set_cleanup_interval(Duration::from_secs(1));
        assert_eq!(settings.cleanup_interval(), Duration::from_secs(1));
    }
}
