//! Configuration management for Windowguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, WindowguardError};
use crate::ratelimit::{RuleSet, RuleTable, RuleTableConfig, DEFAULT_USER_DOMAIN};

/// Environment variable prefix; `WINDOWGUARD__REDIS__URL` sets `redis.url`.
pub const ENV_PREFIX: &str = "WINDOWGUARD";

/// Main configuration for Windowguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowguardConfig {
    /// Shared store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written to the store
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rule table; its domains override the inline ones
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline rule table
    #[serde(default = "default_domains")]
    pub domains: HashMap<String, RuleSet>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            domains: default_domains(),
        }
    }
}

fn default_domains() -> HashMap<String, RuleSet> {
    let mut domains = HashMap::new();
    domains.insert(
        DEFAULT_USER_DOMAIN.to_string(),
        RuleSet::new(vec![crate::ratelimit::Rule {
            window_secs: 60,
            max_calls: 200,
        }]),
    );
    domains
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WindowguardConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `WINDOWGUARD__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WindowguardError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WindowguardError::Config(e.to_string()))
    }

    /// Build the rule table from the inline domains and the optional rules file.
    pub fn rule_table(&self) -> Result<RuleTable> {
        let mut domains = self.rate_limiting.domains.clone();
        if let Some(path) = &self.rate_limiting.rules_path {
            domains.extend(RuleTableConfig::from_file(path)?.domains);
        }
        Ok(RuleTable::from_config(RuleTableConfig { domains }))
    }
}
