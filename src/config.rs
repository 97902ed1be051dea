//! Configuration types for novel-dl
//!
//! Every behavior knob is configurable with sensible defaults; a
//! `Config::default()` works out of the box.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Rate-limited fetcher settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry behavior for transient per-chapter failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// EPUB output settings
    #[serde(default)]
    pub epub: EpubConfig,
}

/// Rate-limited fetcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum number of concurrently in-flight source requests (default: 3)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Minimum delay between the starts of successive dispatches (default: 500 ms)
    ///
    /// Measured dispatch-start to dispatch-start, not completion to start, so
    /// slow responses do not compound the pacing.
    #[serde(default = "default_request_delay", with = "duration_ms_serde")]
    pub request_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 3,
            request_delay: Duration::from_millis(500),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per chapter (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// EPUB output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpubConfig {
    /// Language tag written into the package metadata (default: "en")
    #[serde(default = "default_language")]
    pub language: String,

    /// Placeholder body for locked chapters
    #[serde(default = "default_locked_placeholder")]
    pub locked_placeholder: String,

    /// Placeholder body for failed chapters
    #[serde(default = "default_failed_placeholder")]
    pub failed_placeholder: String,
}

impl Default for EpubConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            locked_placeholder: default_locked_placeholder(),
            failed_placeholder: default_failed_placeholder(),
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    3
}

fn default_request_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

fn default_locked_placeholder() -> String {
    "This chapter is locked on the source and could not be downloaded.".to_string()
}

fn default_failed_placeholder() -> String {
    "This chapter failed to download. Re-run the sync with retry enabled.".to_string()
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second values)
pub(crate) mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
