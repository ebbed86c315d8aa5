//! API keys, instance grants and per-key rate limiting
//!
//! Keys are never held in clear: configured keys are digested on load and the
//! presented key is digested before lookup.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig, RateLimitConfig, WILDCARD_INSTANCE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Missing or invalid API key")]
    InvalidKey,
    #[error("Key has no access to instance {0}")]
    Forbidden(String),
    #[error("Unknown instance {0}")]
    UnknownInstance(String),
}

/// The caller a request is served for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    /// Stable, non-secret key label for logs and rate-limit buckets
    pub key_id: String,
    pub instance_hash: String,
    pub instance_name: Option<String>,
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Checked in order: key known (401), instance known (404), key grants the
    /// instance (403).
    async fn authorize(&self, api_key: &str, instance_hash: &str) -> Result<Tenant, AccessError>;
}

/// Lowercase hex SHA-256 of an API key.
pub fn key_digest(api_key: &str) -> String {
    format!("{:x}", Sha256::digest(api_key.as_bytes()))
}

#[derive(Debug, Clone)]
struct KeyGrant {
    key_id: String,
    all_instances: bool,
    instances: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct StaticAccessControl {
    keys: HashMap<String, KeyGrant>,
    instances: HashMap<String, Option<String>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, hash: &str, name: Option<&str>) -> Self {
        self.instances
            .insert(hash.to_string(), name.map(str::to_string));
        self
    }

    /// Register a clear-text key granting `instances` (`"*"` for all).
    pub fn with_key(self, api_key: &str, instances: &[&str]) -> Self {
        self.with_key_digest(key_digest(api_key), None, instances)
    }

    pub fn with_key_digest(
        mut self,
        digest: String,
        name: Option<String>,
        instances: &[&str],
    ) -> Self {
        let digest = digest.to_ascii_lowercase();
        let key_id = name
            .unwrap_or_else(|| format!("key-{}", digest.chars().take(8).collect::<String>()));
        let all_instances = instances.contains(&WILDCARD_INSTANCE);
        self.keys.insert(
            digest,
            KeyGrant {
                key_id,
                all_instances,
                instances: instances
                    .iter()
                    .filter(|i| **i != WILDCARD_INSTANCE)
                    .map(|i| i.to_string())
                    .collect(),
            },
        );
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let mut access = config.instances.iter().fold(Self::new(), |acc, instance| {
            acc.with_instance(&instance.hash, instance.name.as_deref())
        });
        for (idx, key) in config.api_keys.iter().enumerate() {
            let digest = match (&key.key, &key.key_sha256) {
                (Some(clear), _) => key_digest(clear),
                (None, Some(digest)) if is_sha256_hex(digest) => digest.clone(),
                (None, Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "api_keys[{}].key_sha256 is not a SHA-256 hex digest",
                        idx
                    )))
                }
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "api_keys[{}] needs either `key` or `key_sha256`",
                        idx
                    )))
                }
            };
            let instances: Vec<&str> = key.instances.iter().map(String::as_str).collect();
            access = access.with_key_digest(digest, key.name.clone(), &instances);
        }
        Ok(access)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn authorize(&self, api_key: &str, instance_hash: &str) -> Result<Tenant, AccessError> {
        let grant = self
            .keys
            .get(&key_digest(api_key))
            .ok_or(AccessError::InvalidKey)?;
        let instance_name = self
            .instances
            .get(instance_hash)
            .ok_or_else(|| AccessError::UnknownInstance(instance_hash.to_string()))?;
        if !grant.all_instances && !grant.instances.contains(instance_hash) {
            return Err(AccessError::Forbidden(instance_hash.to_string()));
        }
        Ok(Tenant {
            key_id: grant.key_id.clone(),
            instance_hash: instance_hash.to_string(),
            instance_name: instance_name.clone(),
        })
    }
}

const PRUNE_THRESHOLD: usize = 4096;

/// Fixed-window request counter per key.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    buckets: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window,
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.requests_per_window,
            Duration::from_secs(config.window_secs.max(1)),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Count one request for `key`; false once the window's budget is spent.
    pub fn allow(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if buckets.len() > PRUNE_THRESHOLD {
            let window = self.window;
            buckets.retain(|_, (started, _)| now.duration_since(*started) < window);
        }

        let bucket = buckets.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(bucket.0) >= self.window {
            *bucket = (now, 0);
        }
        if bucket.1 >= self.limit {
            return false;
        }
        bucket.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyConfig, InstanceConfig};

    fn access() -> StaticAccessControl {
        StaticAccessControl::new()
            .with_instance("inst-a", Some("Docs"))
            .with_instance("inst-b", None)
            .with_key("sk-a", &["inst-a"])
            .with_key("sk-all", &["*"])
    }

    #[tokio::test]
    async fn test_granted_key_is_authorized() {
        let tenant = access().authorize("sk-a", "inst-a").await.expect("authorized");
        assert_eq!(tenant.instance_name.as_deref(), Some("Docs"));
        assert!(tenant.key_id.starts_with("key-"));
        assert!(!tenant.key_id.contains("sk-a"));
    }

    #[tokio::test]
    async fn test_checks_run_in_status_order() {
        let access = access();
        assert_eq!(
            access.authorize("nope", "missing").await,
            Err(AccessError::InvalidKey)
        );
        assert_eq!(
            access.authorize("sk-a", "missing").await,
            Err(AccessError::UnknownInstance("missing".to_string()))
        );
        assert_eq!(
            access.authorize("sk-a", "inst-b").await,
            Err(AccessError::Forbidden("inst-b".to_string()))
        );
        assert!(access.authorize("sk-all", "inst-b").await.is_ok());
    }

    #[tokio::test]
    async fn test_config_accepts_digested_keys() {
        let config = GatewayConfig {
            instances: vec![InstanceConfig {
                hash: "inst-a".to_string(),
                name: None,
            }],
            api_keys: vec![ApiKeyConfig {
                name: Some("ci".to_string()),
                key_sha256: Some(key_digest("sk-secret").to_uppercase()),
                instances: vec!["inst-a".to_string()],
                ..ApiKeyConfig::default()
            }],
            ..GatewayConfig::default()
        };
        let access = StaticAccessControl::from_config(&config).expect("config");
        assert_eq!(access.key_count(), 1);
        let tenant = access.authorize("sk-secret", "inst-a").await.expect("authorized");
        assert_eq!(tenant.key_id, "ci");
    }

    #[tokio::test]
    async fn test_unnamed_digest_key_id_respects_char_boundaries() {
        let access = StaticAccessControl::new()
            .with_instance("inst-a", None)
            .with_key_digest("ключ-доступа".to_string(), None, &["inst-a"]);
        assert_eq!(access.key_count(), 1);
        assert_eq!(
            access.authorize("anything", "inst-a").await,
            Err(AccessError::InvalidKey)
        );

        let short = StaticAccessControl::new().with_key_digest("ab".to_string(), None, &["*"]);
        assert_eq!(short.key_count(), 1);
    }

    #[test]
    fn test_config_rejects_malformed_digest() {
        let config = GatewayConfig {
            api_keys: vec![ApiKeyConfig {
                key_sha256: Some("abc".to_string()),
                instances: vec!["*".to_string()],
                ..ApiKeyConfig::default()
            }],
            ..GatewayConfig::default()
        };
        assert!(matches!(
            StaticAccessControl::from_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_key_digest_is_lowercase_hex() {
        let digest = key_digest("sk-a");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_rate_limiter_counts_per_key() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_rate_limiter_window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_disabled_limiter_allows_everything() {
        let limiter = RateLimiter::disabled();
        assert!((0..1000).all(|_| limiter.allow("a")));
    }
}
