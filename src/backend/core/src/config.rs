//! Configuration management.

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AegisConfig {
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Decision engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Cache backend: "in_memory" or "redis"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Redis connection URL (redis backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix for shared Redis instances
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// In-memory capacity (entries)
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,

    /// Decision TTL in seconds
    #[serde(default = "default_decision_ttl_secs")]
    pub decision_ttl_secs: u64,

    /// Disable caching entirely
    #[serde(default)]
    pub disabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            max_capacity: default_max_capacity(),
            decision_ttl_secs: default_decision_ttl_secs(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Change-event channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySettings {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_cache_backend() -> String { "in_memory".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "aegis:".to_string() }
fn default_max_capacity() -> u64 { 10_000 }
fn default_decision_ttl_secs() -> u64 { 300 }
fn default_event_capacity() -> usize { 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl AegisConfig {
    /// Load configuration from environment variables (`AEGIS__` prefix).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AEGIS").separator("__"))
            .build()?;

        let cfg: AegisConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("AEGIS").separator("__"))
            .build()?;

        let cfg: AegisConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Decision TTL as a duration.
    pub fn decision_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache.decision_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AegisConfig::default();
        assert_eq!(cfg.cache.backend, "in_memory");
        assert_eq!(cfg.cache.decision_ttl_secs, 300);
        assert!(!cfg.cache.disabled);
        assert_eq!(cfg.observability.log_level, "info");
        assert_eq!(cfg.decision_ttl(), std::time::Duration::from_secs(300));
    }
}
