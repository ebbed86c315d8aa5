//! Built-in retrieval backends

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use super::{EvidenceRecord, EvidenceResolver, Resolution, ResolveError};
use crate::config::ConfigError;

/// In-memory records keyed by instance hash, then by id.
///
/// Backs local development and tests. The JSON file format is an object
/// mapping each instance hash to an array of records.
#[derive(Debug, Default)]
pub struct StaticEvidenceResolver {
    records: RwLock<HashMap<String, HashMap<String, EvidenceRecord>>>,
}

impl StaticEvidenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, instance_hash: &str, record: EvidenceRecord) -> Self {
        self.insert(instance_hash, record);
        self
    }

    pub fn insert(&self, instance_hash: &str, record: EvidenceRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(instance_hash.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, Vec<EvidenceRecord>> = serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("evidence file: {}", e)))?;
        let resolver = Self::new();
        for (instance_hash, records) in parsed {
            for record in records {
                resolver.insert(&instance_hash, record);
            }
        }
        Ok(resolver)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn record_count(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl EvidenceResolver for StaticEvidenceResolver {
    async fn resolve(&self, instance_hash: &str, id: &str) -> Result<Resolution, ResolveError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(instance_hash)
            .and_then(|by_id| by_id.get(id))
            .cloned()
            .map(Resolution::Found)
            .unwrap_or(Resolution::NotFound))
    }
}

/// Resolves ids against a retrieval service over HTTP.
///
/// `GET {base_url}/instances/{instance_hash}/evidence/{id}` answers the record
/// as JSON; 404 is a definitive miss, every other failure is transient.
pub struct HttpEvidenceResolver {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpEvidenceResolver {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, bearer_token)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    /// Build a resolver whose requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("retrieval client: {}", e)))?;
        Ok(Self::with_client(client, base_url, bearer_token))
    }

    pub fn record_url(&self, instance_hash: &str, id: &str) -> String {
        format!(
            "{}/instances/{}/evidence/{}",
            self.base_url,
            urlencoding::encode(instance_hash),
            urlencoding::encode(id)
        )
    }
}

#[async_trait]
impl EvidenceResolver for HttpEvidenceResolver {
    async fn resolve(&self, instance_hash: &str, id: &str) -> Result<Resolution, ResolveError> {
        let url = self.record_url(instance_hash, id);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "Retrieval service has no record");
                Ok(Resolution::NotFound)
            }
            status if status.is_success() => {
                let record: EvidenceRecord = response
                    .json()
                    .await
                    .map_err(|e| ResolveError::InvalidPayload(e.to_string()))?;
                Ok(Resolution::Found(record))
            }
            status => Err(ResolveError::Transport(format!(
                "retrieval service answered {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_answers_by_instance_and_id() {
        let resolver = StaticEvidenceResolver::new()
            .with_record("inst", EvidenceRecord::new("0", "web", "http://x", "Bio101"));

        assert!(matches!(
            resolver.resolve("inst", "0").await,
            Ok(Resolution::Found(r)) if r.title == "Bio101"
        ));
        assert!(matches!(
            resolver.resolve("inst", "1").await,
            Ok(Resolution::NotFound)
        ));
        assert!(matches!(
            resolver.resolve("other", "0").await,
            Ok(Resolution::NotFound)
        ));
    }

    #[test]
    fn test_static_resolver_loads_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("evidence.json");
        std::fs::write(
            &path,
            r#"{
                "inst-a": [
                    {"id": "0", "source": "web", "url": "http://x", "title": "A0"},
                    {"id": "1", "source": "web", "url": "http://y", "title": "A1",
                     "snippet": {"pre": "", "text": "quoted", "post": ""}}
                ],
                "inst-b": []
            }"#,
        )
        .expect("write");

        let resolver = StaticEvidenceResolver::from_json_file(&path).expect("load");
        assert_eq!(resolver.record_count(), 2);
    }

    #[test]
    fn test_static_resolver_rejects_malformed_json() {
        assert!(matches!(
            StaticEvidenceResolver::from_json_str("[1, 2]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_http_resolver_encodes_path_segments() {
        let resolver = HttpEvidenceResolver::new("http://search.internal/", None);
        assert_eq!(
            resolver.record_url("inst/1", "a b"),
            "http://search.internal/instances/inst%2F1/evidence/a%20b"
        );
    }

    #[tokio::test]
    async fn test_http_resolver_unreachable_service_is_transient() {
        let resolver = HttpEvidenceResolver::with_timeout(
            "http://127.0.0.1:1",
            Some("token".to_string()),
            Duration::from_millis(500),
        )
        .expect("client");
        assert!(matches!(
            resolver.resolve("inst", "0").await,
            Err(ResolveError::Transport(_))
        ));
    }
}
