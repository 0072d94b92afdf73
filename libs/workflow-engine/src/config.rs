//! Engine configuration: defaults layered with an optional file and
//! `ENGINE_`-prefixed environment overrides, via the `config` crate the
//! same way `apps/api` layers its own settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use glyph_domain::enums::BackoffType;
use glyph_domain::step::WorkConfig;

/// Tunables for the bounded engine event queue (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 32,
            max_retries: 3,
            retry_delay_ms: 250,
        }
    }
}

impl EventQueueConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// The default `WorkConfig` used by steps that omit one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultWorkConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_type: BackoffType,
    pub parallelism: i32,
}

impl Default for DefaultWorkConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_type: BackoffType::Exponential,
            parallelism: 1,
        }
    }
}

impl From<DefaultWorkConfig> for WorkConfig {
    fn from(d: DefaultWorkConfig) -> Self {
        WorkConfig {
            max_retries: d.max_retries,
            backoff_ms: d.backoff_ms,
            max_backoff_ms: d.max_backoff_ms,
            backoff_type: d.backoff_type,
            parallelism: d.parallelism,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub event_queue: EventQueueConfig,
    pub default_work_config: DefaultWorkConfig,
    pub memo_cache_capacity: usize,
    pub script_cache_capacity: usize,
    pub webhook_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_queue: EventQueueConfig::default(),
            default_work_config: DefaultWorkConfig::default(),
            memo_cache_capacity: 10_000,
            script_cache_capacity: 1_000,
            webhook_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then an optional config file at `path`, then
    /// `ENGINE_`-prefixed environment variables (e.g. `ENGINE_MEMO_CACHE_CAPACITY`),
    /// each layer overriding the last.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder
            .add_source(config::Environment::with_prefix("ENGINE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
