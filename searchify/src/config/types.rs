use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::citation::IdGrammar;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Root configuration for the streaming gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP listener binds to
    pub bind_addr: String,
    pub stream: StreamConfig,
    pub evidence: EvidenceConfig,
    pub generation: GenerationConfig,
    pub retrieval: RetrievalConfig,
    pub rate_limit: RateLimitConfig,
    pub api_keys: Vec<ApiKeyConfig>,
    pub instances: Vec<InstanceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            stream: StreamConfig::default(),
            evidence: EvidenceConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            rate_limit: RateLimitConfig::default(),
            api_keys: Vec::new(),
            instances: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. A relative static evidence `path` is
    /// resolved against the directory holding the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let (RetrievalConfig::Static { path: Some(evidence) }, Some(base)) =
            (&mut config.retrieval, path.parent())
        {
            if evidence.is_relative() {
                *evidence = base.join(&*evidence);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.delta_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "stream.delta_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.stream.frame_buffer == 0 {
            return Err(ConfigError::Invalid(
                "stream.frame_buffer must be at least 1".to_string(),
            ));
        }
        if self.stream.max_deltas_per_chunk == 0 {
            return Err(ConfigError::Invalid(
                "stream.max_deltas_per_chunk must be at least 1".to_string(),
            ));
        }
        if self.evidence.max_resolve_attempts == 0 {
            return Err(ConfigError::Invalid(
                "evidence.max_resolve_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("stream.idle_timeout_ms", self.stream.idle_timeout_ms),
            ("stream.write_timeout_ms", self.stream.write_timeout_ms),
            ("evidence.resolve_timeout_ms", self.evidence.resolve_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.rate_limit.requests_per_window > 0 && self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be positive when limiting is enabled".to_string(),
            ));
        }

        let known: HashSet<&str> = self.instances.iter().map(|i| i.hash.as_str()).collect();
        for (idx, key) in self.api_keys.iter().enumerate() {
            if key.key.is_none() && key.key_sha256.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "api_keys[{}] needs either `key` or `key_sha256`",
                    idx
                )));
            }
            for instance in &key.instances {
                if instance != WILDCARD_INSTANCE && !known.contains(instance.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "api_keys[{}] grants unknown instance `{}`",
                        idx, instance
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Grants a key access to every configured instance.
pub const WILDCARD_INSTANCE: &str = "*";

/// Per-session streaming behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Depth of the producer -> session delta queue
    pub delta_queue_depth: usize,
    /// Frames buffered between the session and the HTTP body
    pub frame_buffer: usize,
    /// Upper bound of queued deltas folded into one chunk
    pub max_deltas_per_chunk: usize,
    /// Maximum silence from the generation source before the session completes
    pub idle_timeout_ms: u64,
    /// Maximum time a single frame write may block
    pub write_timeout_ms: u64,
    pub citation_grammar: IdGrammar,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            delta_queue_depth: 8,
            frame_buffer: 4,
            max_deltas_per_chunk: 16,
            idle_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            citation_grammar: IdGrammar::Numeric,
        }
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Evidence resolution behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Lookups per id before a transient failure becomes permanent
    pub max_resolve_attempts: u32,
    pub resolve_timeout_ms: u64,
    /// Entries kept by the cross-session cache; 0 disables it
    pub shared_cache_entries: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_resolve_attempts: 2,
            resolve_timeout_ms: 5_000,
            shared_cache_entries: 10_000,
        }
    }
}

impl EvidenceConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

/// Where generated text comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationConfig {
    /// Upstream generation engine speaking SSE
    Http {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    /// Streams the query back word by word
    Echo {
        #[serde(default = "default_echo_delay_ms")]
        delay_ms: u64,
    },
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig::Echo {
            delay_ms: default_echo_delay_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_echo_delay_ms() -> u64 {
    50
}

/// Where evidence records are resolved from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalConfig {
    /// Records loaded once from a JSON file keyed by instance hash
    Static {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Retrieval service, `GET {base_url}/instances/{hash}/evidence/{id}`
    Http {
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig::Static { path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per key and window; 0 disables limiting
    pub requests_per_window: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiKeyConfig {
    /// Display name used in logs and rate-limit buckets
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Lowercase hex SHA-256 of the key, for configs that must not hold secrets
    #[serde(default)]
    pub key_sha256: Option<String>,
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub hash: String,
    #[serde(default)]
    pub name: Option<String>,
}
