//! Incremental response streaming
//!
//! - `generation`: the generation source seam and built-in sources
//! - `transport`: SSE framing and frame sinks
//! - `stream_session`: the per-session producer/consumer loop

pub mod generation;
pub mod stream_session;
pub mod transport;

pub use generation::{
    EchoGenerationSource, GenerationError, GenerationEvent, GenerationRequest, GenerationSource,
    GenerationStream, HttpGenerationSource, ScriptStep, ScriptedGenerationSource, StreamMonitor,
    TextDelta,
};
pub use stream_session::{SessionReport, StreamSession, Termination};
pub use transport::{
    decode_frames, parse_frames, ChannelFrameSink, Frame, FrameSink, TransportEncoder,
    TransportError, WriterFrameSink,
};
