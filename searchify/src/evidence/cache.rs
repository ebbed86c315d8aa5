//! Cross-session read-through cache in front of a resolver

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use super::{EvidenceRecord, EvidenceResolver, Resolution, ResolveError};

/// Shares found records between concurrent sessions of the same instance.
///
/// Only `Found` answers are cached. Misses and errors always go to the inner
/// resolver, so a record published later becomes visible to new sessions.
/// Once `max_entries` is reached new records are served but not stored.
pub struct SharedEvidenceCache {
    inner: Arc<dyn EvidenceResolver>,
    entries: DashMap<(String, String), EvidenceRecord>,
    max_entries: usize,
}

impl SharedEvidenceCache {
    pub fn new(inner: Arc<dyn EvidenceResolver>, max_entries: usize) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl EvidenceResolver for SharedEvidenceCache {
    async fn resolve(&self, instance_hash: &str, id: &str) -> Result<Resolution, ResolveError> {
        let key = (instance_hash.to_string(), id.to_string());
        // clone out of the shard guard before awaiting
        let cached = self.entries.get(&key).map(|entry| entry.value().clone());
        if let Some(record) = cached {
            trace!(instance_hash, citation_id = id, "Shared evidence cache hit");
            return Ok(Resolution::Found(record));
        }

        let resolution = self.inner.resolve(instance_hash, id).await?;
        if let Resolution::Found(record) = &resolution {
            if self.entries.len() < self.max_entries {
                self.entries.insert(key, record.clone());
            }
        }
        Ok(resolution)
    }
}
