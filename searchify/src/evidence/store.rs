//! Per-session evidence cache
//!
//! Owned exclusively by one session. Resolved ids are never fetched again,
//! definitive misses are never retried, and transient failures are retried on
//! later chunks until `max_resolve_attempts` is spent.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EvidenceRecord, EvidenceResolver, Resolution, ResolveError};
use crate::config::EvidenceConfig;

pub struct EvidenceStore {
    instance_hash: String,
    resolver: Arc<dyn EvidenceResolver>,
    resolved: HashMap<String, EvidenceRecord>,
    unresolved: HashSet<String>,
    attempts: HashMap<String, u32>,
    max_attempts: u32,
    resolve_timeout: Duration,
}

impl EvidenceStore {
    pub fn new(
        instance_hash: impl Into<String>,
        resolver: Arc<dyn EvidenceResolver>,
        config: &EvidenceConfig,
    ) -> Self {
        Self {
            instance_hash: instance_hash.into(),
            resolver,
            resolved: HashMap::new(),
            unresolved: HashSet::new(),
            attempts: HashMap::new(),
            max_attempts: config.max_resolve_attempts.max(1),
            resolve_timeout: config.resolve_timeout(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&EvidenceRecord> {
        self.resolved.get(id)
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.resolved.contains_key(id)
    }

    /// True once the id has been given up on for the rest of the session.
    pub fn is_unresolved(&self, id: &str) -> bool {
        self.unresolved.contains(id)
    }

    pub fn known_ids(&self) -> impl Iterator<Item = &str> {
        self.resolved.keys().map(String::as_str)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    fn needs_lookup(&self, id: &str) -> bool {
        !self.resolved.contains_key(id) && !self.unresolved.contains(id)
    }

    /// Resolve a single id, returning the cached record when already known.
    pub async fn resolve(&mut self, id: &str) -> Option<&EvidenceRecord> {
        self.resolve_pending([id]).await;
        self.resolved.get(id)
    }

    /// Look up every id that is neither resolved nor given up on.
    ///
    /// Lookups for one batch run concurrently; outcomes are applied in input
    /// order so the store state does not depend on completion order.
    pub async fn resolve_pending<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let pending: Vec<String> = ids
            .into_iter()
            .filter(|id| self.needs_lookup(id) && seen.insert(*id))
            .map(str::to_string)
            .collect();
        if pending.is_empty() {
            return;
        }

        let resolver = Arc::clone(&self.resolver);
        let instance_hash = self.instance_hash.clone();
        let timeout = self.resolve_timeout;
        let lookups = pending.iter().map(|id| {
            let resolver = Arc::clone(&resolver);
            let instance_hash = instance_hash.clone();
            let id = id.clone();
            async move {
                match tokio::time::timeout(timeout, resolver.resolve(&instance_hash, &id)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ResolveError::Timeout(timeout)),
                }
            }
        });
        let outcomes = join_all(lookups).await;

        for (id, outcome) in pending.into_iter().zip(outcomes) {
            self.record_outcome(id, outcome);
        }
    }

    fn record_outcome(&mut self, id: String, outcome: Result<Resolution, ResolveError>) {
        let attempt = {
            let counter = self.attempts.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        match outcome {
            Ok(Resolution::Found(record)) => {
                if record.id != id {
                    warn!(
                        citation_id = %id,
                        returned_id = %record.id,
                        "Retrieval returned a record for a different id; citation left unresolved"
                    );
                    self.give_up(id);
                } else if let Some(field) = record.missing_required_field() {
                    warn!(
                        citation_id = %id,
                        missing = field,
                        "Retrieval returned a record without a required field; citation left unresolved"
                    );
                    self.give_up(id);
                } else {
                    self.attempts.remove(&id);
                    self.resolved.insert(id, record);
                }
            }
            Ok(Resolution::NotFound) => {
                debug!(citation_id = %id, instance_hash = %self.instance_hash, "Citation does not resolve");
                self.give_up(id);
            }
            Err(err) if attempt >= self.max_attempts => {
                warn!(citation_id = %id, attempt, error = %err, "Giving up on citation");
                self.give_up(id);
            }
            Err(err) => {
                debug!(citation_id = %id, attempt, error = %err, "Citation lookup failed, will retry");
            }
        }
    }

    fn give_up(&mut self, id: String) {
        self.attempts.remove(&id);
        self.unresolved.insert(id);
    }
}

impl std::fmt::Debug for EvidenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceStore")
            .field("instance_hash", &self.instance_hash)
            .field("resolved", &self.resolved.len())
            .field("unresolved", &self.unresolved.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
