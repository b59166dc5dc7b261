//! Configuration types for relay-dl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::{Backoff, RetryPolicy};

/// Main configuration for the pipeline
///
/// Fields are organized into logical sub-configs:
/// - [`fetch`](FetchConfig): output directory, concurrency, fetch retries
/// - [`publish`](PublishConfig): upload sink, publish retries and backoff
/// - [`notifications`](NotificationConfig): webhooks
/// - [`persistence`](PersistenceConfig): ledger location
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Fetch stage settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Publish stage settings
    #[serde(default)]
    pub publish: PublishConfig,

    /// Notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Ledger storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load a configuration from a JSON document on disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            message: format!("cannot read config file '{}': {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            message: format!("invalid config file '{}': {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.fetch.concurrency == 0 {
            return Err(config_error("fetch concurrency must be at least 1", "fetch.concurrency"));
        }
        if self.publish.max_retries == 0 {
            return Err(config_error(
                "publish max_retries must be at least 1",
                "publish.max_retries",
            ));
        }

        match url::Url::parse(&self.publish.endpoint) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            _ => {
                return Err(config_error(
                    format!("publish endpoint '{}' is not an http(s) URL", self.publish.endpoint),
                    "publish.endpoint",
                ));
            }
        }

        for hook in &self.notifications.webhooks {
            if url::Url::parse(&hook.url).is_err() {
                return Err(config_error(
                    format!("webhook url '{}' is not a valid URL", hook.url),
                    "notifications.webhooks",
                ));
            }
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

/// Fetch stage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Directory fetched artifacts are written to (default: "./downloads")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Maximum concurrent fetches (default: 3)
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    /// Retries after the first failed attempt (default: 2)
    #[serde(default = "default_fetch_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed delay between fetch attempts (default: 2000 ms)
    #[serde(default = "default_fetch_retry_delay", with = "duration_ms_serde")]
    pub retry_delay: Duration,

    /// Per-request timeout (default: 300 seconds)
    #[serde(default = "default_request_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,

    /// Minimum spacing between successive fetch requests (None = unpaced)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub min_interval: Option<Duration>,

    /// User-Agent sent with fetch requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            concurrency: default_fetch_concurrency(),
            retry_attempts: default_fetch_retry_attempts(),
            retry_delay: default_fetch_retry_delay(),
            timeout: default_request_timeout(),
            min_interval: None,
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    /// Retry policy for the fetch stage: first try plus `retry_attempts` retries
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.saturating_add(1),
            backoff: Backoff::Fixed(self.retry_delay),
        }
    }
}

/// Publish stage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Base URL of the upload sink; the filename is appended as the last path segment
    #[serde(default)]
    pub endpoint: String,

    /// Optional Authorization header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Total publish attempts per artifact (default: 10)
    #[serde(default = "default_publish_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1000 ms)
    #[serde(default = "default_publish_base_delay", with = "duration_ms_serde")]
    pub base_delay: Duration,

    /// Added to the delay for every further retry (default: 5000 ms)
    #[serde(default = "default_publish_delay_increment", with = "duration_ms_serde")]
    pub delay_increment: Duration,

    /// Per-request timeout (default: 300 seconds)
    #[serde(default = "default_request_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,

    /// Minimum spacing between successive upload requests (None = unpaced)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub min_interval: Option<Duration>,

    /// Remove the local copy once the artifact is delivered (default: false)
    #[serde(default)]
    pub delete_after_publish: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_header: None,
            max_retries: default_publish_max_retries(),
            base_delay: default_publish_base_delay(),
            delay_increment: default_publish_delay_increment(),
            timeout: default_request_timeout(),
            min_interval: None,
            delete_after_publish: false,
        }
    }
}

impl PublishConfig {
    /// Retry policy for the publish stage: linearly widening delays
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            backoff: Backoff::Linear {
                base: self.base_delay,
                increment: self.delay_increment,
            },
        }
    }
}

/// Notification configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook configurations
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

/// Webhook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to POST to
    pub url: String,

    /// Events that trigger this webhook
    pub events: Vec<WebhookEvent>,

    /// Optional authentication header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for webhook requests (default: 30 seconds)
    #[serde(default = "default_webhook_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// Webhook trigger event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    /// Triggered when an artifact is delivered to the sink
    OnPublished,
    /// Triggered once at the end of every run
    OnRunComplete,
}

/// Ledger storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the ledger JSON document (default: "./ledger.json")
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./ledger.json")
}

fn default_fetch_concurrency() -> usize {
    3
}

fn default_fetch_retry_attempts() -> u32 {
    2
}

fn default_fetch_retry_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_user_agent() -> String {
    concat!("relay-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_publish_max_retries() -> u32 {
    10
}

fn default_publish_base_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_publish_delay_increment() -> Duration {
    Duration::from_millis(5000)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (integer milliseconds)
mod duration_ms_serde {
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

// Optional Duration serialization helper (integer milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
