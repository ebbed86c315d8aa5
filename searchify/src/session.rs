//! Per-request session state
//!
//! A session is owned by exactly one streaming task. It holds the text
//! generated so far and the session-scoped evidence store, and walks a one-way
//! lifecycle `Active -> Completing -> Closed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::EvidenceConfig;
use crate::evidence::{EvidenceResolver, EvidenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting generated text
    Active,
    /// Generation ended; the terminal chunk is being produced
    Completing,
    /// Terminal chunk written or the client went away
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("Session {session_id} cannot accept text while {state:?}")]
    NotAccepting {
        session_id: String,
        state: SessionState,
    },
    #[error("Session {session_id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
}

pub struct Session {
    id: String,
    instance_hash: String,
    query: String,
    accumulated_text: String,
    state: SessionState,
    evidence: EvidenceStore,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        instance_hash: impl Into<String>,
        query: impl Into<String>,
        resolver: Arc<dyn EvidenceResolver>,
        config: &EvidenceConfig,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), instance_hash, query, resolver, config)
    }

    pub fn with_id(
        id: impl Into<String>,
        instance_hash: impl Into<String>,
        query: impl Into<String>,
        resolver: Arc<dyn EvidenceResolver>,
        config: &EvidenceConfig,
    ) -> Self {
        let instance_hash = instance_hash.into();
        Self {
            id: id.into(),
            evidence: EvidenceStore::new(instance_hash.clone(), resolver, config),
            instance_hash,
            query: query.into(),
            accumulated_text: String::new(),
            state: SessionState::Active,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_hash(&self) -> &str {
        &self.instance_hash
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn evidence_mut(&mut self) -> &mut EvidenceStore {
        &mut self.evidence
    }

    /// Append generated text. Text is only ever appended, never rewritten.
    pub fn append(&mut self, text: &str) -> Result<(), SessionStateError> {
        if self.state != SessionState::Active {
            return Err(SessionStateError::NotAccepting {
                session_id: self.id.clone(),
                state: self.state,
            });
        }
        self.accumulated_text.push_str(text);
        Ok(())
    }

    pub fn begin_completing(&mut self) -> Result<(), SessionStateError> {
        match self.state {
            SessionState::Active => {
                self.state = SessionState::Completing;
                Ok(())
            }
            from => Err(SessionStateError::InvalidTransition {
                session_id: self.id.clone(),
                from,
                to: SessionState::Completing,
            }),
        }
    }

    /// Idempotent; a closed session stays closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instance_hash", &self.instance_hash)
            .field("state", &self.state)
            .field("text_len", &self.accumulated_text.len())
            .field("evidence", &self.evidence)
            .finish()
    }
}
