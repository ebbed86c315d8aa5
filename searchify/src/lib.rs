//! Searchify: citation-aware incremental response streaming
//!
//! A client submits a query for a search instance and receives a stream of
//! chunks. Each chunk carries the full text generated so far plus the evidence
//! records for every citation marker in it that could be resolved. Exactly one
//! chunk per stream has `isDone = true`, and it is the last one.
//!
//! The crate is organised bottom-up:
//! - [`citation`] finds `[id]` markers in text
//! - [`evidence`] resolves ids against the retrieval subsystem
//! - [`session`] and [`chunk`] hold per-request state and build chunks
//! - [`streaming`] drives generation into an SSE connection
//! - [`gateway`] exposes it over HTTP (feature `server`)

pub mod access;
pub mod chunk;
pub mod citation;
pub mod config;
pub mod error;
pub mod evidence;
pub mod session;
pub mod streaming;

#[cfg(feature = "server")]
pub mod gateway;

pub use access::{AccessControl, AccessError, RateLimiter, StaticAccessControl, Tenant};
pub use chunk::{Chunk, ChunkAssembler};
pub use citation::{CitationScanner, CitationSet, IdGrammar};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use evidence::{EvidenceRecord, EvidenceResolver, EvidenceStore, Resolution, ResolveError, Snippet};
pub use session::{Session, SessionState};
pub use streaming::{GenerationEvent, GenerationSource, StreamSession, TextDelta};
