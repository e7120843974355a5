//! Environment-driven configuration
//!
//! One flat struct covers every component; `ClientConfig::load` reads
//! `ASSISTANT_*` environment variables and falls back to defaults for
//! anything unset. Converters hand each component its own config so the
//! components stay decoupled from the environment.

use crate::cache::CacheConfig;
use crate::queue::QueueConfig;
use crate::sync::SyncConfig;
use crate::transport::TransportConfig;
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,

    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,
    #[serde(default = "default_queue_retry_secs")]
    pub queue_retry_secs: u64,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_realtime_endpoint")]
    pub realtime_endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_sweep_secs() -> u64 {
    60
}

fn default_queue_max_size() -> usize {
    100
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_queue_retry_secs() -> u64 {
    30
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_realtime_endpoint() -> String {
    "wss://localhost:8443/ws".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            cache_sweep_secs: default_cache_sweep_secs(),
            queue_max_size: default_queue_max_size(),
            queue_max_retries: default_queue_max_retries(),
            queue_retry_secs: default_queue_retry_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            realtime_endpoint: default_realtime_endpoint(),
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl ClientConfig {
    /// Load from `ASSISTANT_*` environment variables, e.g.
    /// `ASSISTANT_CACHE_TTL_SECS=600`
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("ASSISTANT"))
            .build()?;
        Ok(settings.try_deserialize().unwrap_or_default())
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache_ttl_secs),
            max_memory_entries: self.cache_capacity,
            sweep_interval: Duration::from_secs(self.cache_sweep_secs),
            ..Default::default()
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_size: self.queue_max_size,
            max_retries: self.queue_max_retries,
            retry_delay: Duration::from_secs(self.queue_retry_secs),
            ..Default::default()
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            probe_interval: Duration::from_secs(self.probe_interval_secs),
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.realtime_endpoint.clone(),
            auth_token: self.auth_token.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..Default::default()
        }
    }
}
