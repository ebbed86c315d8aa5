//! Chunk framing and delivery
//!
//! Chunks travel as Server-Sent Events, one JSON object per frame:
//!
//! ```text
//! data: {"isDone":false,"updatedText":"...","search_results":[]}
//!
//! ```
//!
//! The encoder owns the framing; a [`FrameSink`] owns the connection.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::chunk::Chunk;

const DATA_PREFIX: &str = "data: ";
const FRAME_END: &str = "\n\n";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Client disconnected")]
    Disconnected,
    #[error("Write blocked for more than {0:?}")]
    WriteTimeout(Duration),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Failed to encode chunk: {0}")]
    Encode(String),
}

/// One encoded chunk. The payload is a single-line JSON document, so the
/// frame is always exactly one `data:` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: String,
}

impl Frame {
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Length of the frame on the wire.
    pub fn wire_len(&self) -> usize {
        DATA_PREFIX.len() + self.payload.len() + FRAME_END.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        bytes.extend_from_slice(DATA_PREFIX.as_bytes());
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes.extend_from_slice(FRAME_END.as_bytes());
        bytes
    }
}

/// Destination for encoded frames, one per client connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one frame; returns once the frame has been accepted by the
    /// connection, which is where backpressure applies.
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Resolves once the client is known to be gone.
    async fn closed(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportEncoder;

impl TransportEncoder {
    pub fn frame(&self, chunk: &Chunk) -> Result<Frame, TransportError> {
        let payload =
            serde_json::to_string(chunk).map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(Frame { payload })
    }

    pub fn encode(&self, chunk: &Chunk) -> Result<Vec<u8>, TransportError> {
        Ok(self.frame(chunk)?.into_bytes())
    }

    /// Encode and write a chunk, returning the number of bytes written.
    pub async fn write<S: FrameSink + ?Sized>(
        &self,
        sink: &mut S,
        chunk: &Chunk,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let frame = self.frame(chunk)?;
        let len = frame.wire_len();
        tokio::time::timeout(timeout, sink.write_frame(frame))
            .await
            .map_err(|_| TransportError::WriteTimeout(timeout))??;
        Ok(len)
    }
}

/// Decode the chunks carried by an SSE byte stream, such as a response
/// body read by a client.
///
/// Comments, keep-alives and events whose data is not a chunk are skipped.
/// The stream ends at the first transport error.
pub fn decode_frames<S, B, E>(body: S) -> impl Stream<Item = Chunk>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    body.eventsource()
        .take_while(|event| futures::future::ready(event.is_ok()))
        .filter_map(|event| async move {
            let event = event.ok()?;
            serde_json::from_str::<Chunk>(&event.data).ok()
        })
}

/// Decode the chunks carried by a complete SSE body.
pub fn parse_frames(body: &str) -> Vec<Chunk> {
    let bytes = stream::iter([Ok::<_, Infallible>(body.as_bytes().to_vec())]);
    futures::executor::block_on(decode_frames(bytes).collect())
}

/// Hands frames to a bounded channel drained by the HTTP response body.
pub struct ChannelFrameSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelFrameSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelFrameSink {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Writes frames straight onto a byte stream such as a TCP socket.
pub struct WriterFrameSink<W> {
    writer: W,
}

impl<W> WriterFrameSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> FrameSink for WriterFrameSink<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let bytes = frame.into_bytes();
        let result = async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        }
        .await;
        result.map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                TransportError::Disconnected
            }
            _ => TransportError::Io(e.to_string()),
        })
    }

    async fn closed(&self) {
        // a raw writer only reports disconnects on write
        futures::future::pending::<()>().await
    }
}
