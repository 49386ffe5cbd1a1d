//! Configuration parsing and management.

use ditto_cache::CacheConfig;
use ditto_model::duration::serde_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Configuration of one node, matching the `ditto.yml` schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DittoConfig {
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    #[serde(default)]
    pub caches: CachesConfig,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl DittoConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: DittoConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enforcement.parallelism == 0 {
            return Err(invalid("enforcement.parallelism", "must be at least 1"));
        }
        if self.enforcement.ask_timeout.is_zero() {
            return Err(invalid("enforcement.ask-timeout", "must be greater than zero"));
        }
        let retry = &self.enforcement.ask_with_retry;
        if retry.strategy != RetryStrategy::Off && retry.attempts == 0 {
            return Err(invalid("enforcement.ask-with-retry.attempts", "must be at least 1"));
        }
        if retry.backoff_min > retry.backoff_max {
            return Err(invalid(
                "enforcement.ask-with-retry.backoff-min",
                "must not exceed backoff-max",
            ));
        }
        if self.supervisor.min_backoff > self.supervisor.max_backoff {
            return Err(invalid("supervisor.min-backoff", "must not exceed max-backoff"));
        }
        if self.persistence.mailbox_capacity == 0 {
            return Err(invalid("persistence.mailbox-capacity", "must be at least 1"));
        }
        let caches = [
            ("caches.id", &self.caches.id),
            ("caches.enforcer", &self.caches.enforcer),
        ];
        for (field, cache) in caches {
            if cache.maximum_size == Some(0) {
                return Err(invalid(field, "maximum-size must be at least 1"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnforcementConfig {
    /// Timeout of asks against persistence and shard regions
    #[serde(default = "default_ask_timeout", with = "serde_duration")]
    pub ask_timeout: Duration,

    /// Number of signals one enforcement flow processes concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default)]
    pub ask_with_retry: AskWithRetryConfig,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            ask_timeout: default_ask_timeout(),
            parallelism: default_parallelism(),
            ask_with_retry: AskWithRetryConfig::default(),
        }
    }
}

fn default_ask_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_parallelism() -> usize {
    16
}

/// How a failed ask is retried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    Off,
    NoDelay,
    FixedDelay,
    #[default]
    BackoffDelay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AskWithRetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Retries after the first attempt
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_fixed_delay", with = "serde_duration")]
    pub fixed_delay: Duration,

    #[serde(default = "default_backoff_min", with = "serde_duration")]
    pub backoff_min: Duration,

    #[serde(default = "default_backoff_max", with = "serde_duration")]
    pub backoff_max: Duration,
}

impl Default for AskWithRetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            attempts: default_retry_attempts(),
            fixed_delay: default_fixed_delay(),
            backoff_min: default_backoff_min(),
            backoff_max: default_backoff_max(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_fixed_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_min() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CachesConfig {
    /// Thing reference to policy reference
    #[serde(default = "default_cache")]
    pub id: CacheConfig,

    /// Policy reference to policy enforcer
    #[serde(default = "default_cache")]
    pub enforcer: CacheConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            id: default_cache(),
            enforcer: default_cache(),
        }
    }
}

fn default_cache() -> CacheConfig {
    CacheConfig {
        maximum_size: Some(20_000),
        expire_after_write: Some(Duration::from_secs(15 * 60)),
        expire_after_access: Some(Duration::from_secs(15 * 60)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LiveConfig {
    /// Wait for a live response when the command declares no timeout
    #[serde(default = "default_live_timeout", with = "serde_duration")]
    pub default_timeout: Duration,

    /// Receive timeout of acknowledgement forwarders, raised to the command's
    /// own timeout when that is longer
    #[serde(default = "default_forwarder_timeout", with = "serde_duration")]
    pub forwarder_receive_timeout: Duration,

    /// Expiry of response receivers whose signal declares no timeout
    #[serde(default = "default_fallback_expiry", with = "serde_duration")]
    pub response_receiver_fallback_expiry: Duration,

    /// Route live responses through a per-request forwarder
    #[serde(default)]
    pub global_dispatching: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_live_timeout(),
            forwarder_receive_timeout: default_forwarder_timeout(),
            response_receiver_fallback_expiry: default_fallback_expiry(),
            global_dispatching: false,
        }
    }
}

fn default_live_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_forwarder_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_fallback_expiry() -> Duration {
    ditto_cache::DEFAULT_FALLBACK_EXPIRY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervisorConfig {
    #[serde(default = "default_min_backoff", with = "serde_duration")]
    pub min_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "serde_duration")]
    pub max_backoff: Duration,

    /// A child alive this long resets the backoff
    #[serde(default = "default_reset_after", with = "serde_duration")]
    pub reset_after: Duration,

    #[serde(default = "default_passivation", with = "serde_duration")]
    pub passivation_timeout: Duration,

    #[serde(default = "default_supervisor_mailbox")]
    pub mailbox_capacity: usize,

    #[serde(default)]
    pub blocked_namespaces: BTreeSet<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            reset_after: default_reset_after(),
            passivation_timeout: default_passivation(),
            mailbox_capacity: default_supervisor_mailbox(),
            blocked_namespaces: BTreeSet::new(),
        }
    }
}

fn default_min_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_reset_after() -> Duration {
    Duration::from_secs(30)
}

fn default_passivation() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_supervisor_mailbox() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistenceConfig {
    /// Bounded mailbox of each persistence actor
    #[serde(default = "default_persistence_mailbox")]
    pub mailbox_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_persistence_mailbox(),
        }
    }
}

fn default_persistence_mailbox() -> usize {
    100
}
