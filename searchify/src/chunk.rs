//! Chunk assembly
//!
//! A chunk is a snapshot of the session: the whole accumulated text plus every
//! resolved record cited anywhere in it, in order of first citation. Unresolved
//! citations stay in the text and are simply absent from `search_results`.

use serde::{Deserialize, Serialize};

use crate::citation::CitationScanner;
use crate::evidence::EvidenceRecord;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(rename = "isDone")]
    pub is_done: bool,
    #[serde(rename = "updatedText")]
    pub updated_text: String,
    #[serde(default)]
    pub search_results: Vec<EvidenceRecord>,
}

impl Chunk {
    pub fn result_ids(&self) -> Vec<&str> {
        self.search_results.iter().map(|r| r.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkAssembler {
    scanner: CitationScanner,
}

impl ChunkAssembler {
    pub fn new(scanner: CitationScanner) -> Self {
        Self { scanner }
    }

    /// Build a chunk from the current session state, resolving any citation
    /// not seen before. The accumulated text is emitted verbatim.
    pub async fn assemble(&self, session: &mut Session, is_done: bool) -> Chunk {
        let citations = self.scanner.scan(session.accumulated_text());
        session.evidence_mut().resolve_pending(citations.iter()).await;

        let evidence = session.evidence();
        let search_results = citations
            .iter()
            .filter_map(|id| evidence.get(id).cloned())
            .collect();

        Chunk {
            is_done,
            updated_text: session.accumulated_text().to_string(),
            search_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvidenceConfig;
    use crate::evidence::StaticEvidenceResolver;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn session_with(resolver: StaticEvidenceResolver) -> Session {
        Session::new(
            "inst",
            "q",
            Arc::new(resolver),
            &EvidenceConfig::default(),
        )
    }

    fn bio101() -> EvidenceRecord {
        EvidenceRecord::new("0", "web", "http://x", "Bio101")
    }

    #[tokio::test]
    async fn test_cited_and_resolved_record_is_attached() {
        let mut session =
            session_with(StaticEvidenceResolver::new().with_record("inst", bio101()));
        session.append("Photosynthesis ").expect("append");
        session.append("uses light [0].").expect("append");

        let chunk = ChunkAssembler::default().assemble(&mut session, true).await;

        assert_eq!(
            chunk,
            Chunk {
                is_done: true,
                updated_text: "Photosynthesis uses light [0].".to_string(),
                search_results: vec![bio101()],
            }
        );
    }

    #[tokio::test]
    async fn test_unresolved_citation_stays_in_text_only() {
        let mut session = session_with(StaticEvidenceResolver::new());
        session.append("See [5].").expect("append");

        let chunk = ChunkAssembler::default().assemble(&mut session, true).await;

        assert_eq!(chunk.updated_text, "See [5].");
        assert!(chunk.search_results.is_empty());
    }

    #[tokio::test]
    async fn test_results_follow_first_citation_order() {
        let resolver = StaticEvidenceResolver::new()
            .with_record("inst", EvidenceRecord::new("0", "web", "http://a", "A"))
            .with_record("inst", EvidenceRecord::new("2", "web", "http://b", "B"));
        let mut session = session_with(resolver);
        session.append("B [2], A [0], B again [2], gone [9].").expect("append");

        let chunk = ChunkAssembler::default().assemble(&mut session, false).await;

        assert_eq!(chunk.result_ids(), vec!["2", "0"]);
    }

    #[tokio::test]
    async fn test_assembling_twice_without_new_text_is_identical() {
        let mut session =
            session_with(StaticEvidenceResolver::new().with_record("inst", bio101()));
        session.append("light [0]").expect("append");
        let assembler = ChunkAssembler::default();

        let first = assembler.assemble(&mut session, false).await;
        let second = assembler.assemble(&mut session, false).await;

        assert_eq!(first, second);
    }

    #[test]
    fn test_chunk_uses_wire_field_names() {
        let chunk = Chunk {
            is_done: false,
            updated_text: "partial".to_string(),
            search_results: Vec::new(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).expect("serialize"),
            json!({"isDone": false, "updatedText": "partial", "search_results": []})
        );
    }
}
