//! Server-Sent Events decoding for the chat stream.
//!
//! [`FrameDecoder`] is a push parser: feed it raw chunks as they arrive and
//! it returns the frames completed by that chunk. A chunk may end anywhere,
//! including inside a line or inside a multi-byte UTF-8 character; the
//! incomplete tail stays buffered until the next chunk.
//!
//! A frame ends at a blank line. Its `data:` payload must be JSON; a frame
//! whose payload does not parse is dropped and decoding continues with the
//! next frame. Dropped frames are counted but never reported as errors.
//!
//! [`FrameStream`] wraps a chunk stream plus a [`CancellationToken`] and
//! yields one frame at a time. Cancellation is checked at every read; once it
//! fires the stream is abandoned, not drained.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConsoleError, ConsoleResult};
use crate::types::StreamFrame;

/// Event name used when a frame carries no `event:` field.
const DEFAULT_EVENT: &str = "message";

/// Incremental SSE frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    discarded: u64,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the frames it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        frames
    }

    /// Ends decoding. A frame without its terminating blank line is
    /// incomplete and is dropped.
    pub fn finish(&mut self) {
        let pending = !self.buffer.is_empty() || self.event.is_some() || !self.data.is_empty();
        if pending {
            self.discarded += 1;
            debug!(
                buffered_bytes = self.buffer.len(),
                "dropping incomplete frame at end of stream"
            );
        }
        self.buffer.clear();
        self.event = None;
        self.data.clear();
    }

    /// Number of frames dropped so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn process_line(&mut self, line: &str) -> Option<StreamFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id/retry carry nothing this protocol uses.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<StreamFrame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);

        if event.is_none() && data.is_empty() {
            return None;
        }
        let event = event.unwrap_or_else(|| DEFAULT_EVENT.to_string());

        if data.is_empty() {
            self.discard(&event, "missing data field");
            return None;
        }

        let payload = data.join("\n");
        match serde_json::from_str(&payload) {
            Ok(value) => Some(StreamFrame::new(event, value)),
            Err(err) => {
                self.discard(&event, &err.to_string());
                None
            }
        }
    }

    fn discard(&mut self, event: &str, reason: &str) {
        self.discarded += 1;
        debug!(event, reason, "discarding malformed frame");
    }
}

/// Boxed stream of raw body chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ConsoleResult<Vec<u8>>> + Send>>;

/// Result of one [`FrameStream::next_frame`] read.
#[derive(Debug)]
pub enum FrameRead {
    /// A decoded frame.
    Frame(StreamFrame),
    /// The connection closed.
    Closed,
    /// The cancellation token fired; the stream was abandoned.
    Cancelled,
    /// The connection failed mid-stream.
    Failed(ConsoleError),
}

/// A lazy, non-restartable sequence of frames from a chunk stream.
pub struct FrameStream {
    chunks: ChunkStream,
    decoder: FrameDecoder,
    ready: VecDeque<StreamFrame>,
    token: CancellationToken,
    finished: bool,
}

impl fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("ready", &self.ready.len())
            .field("discarded", &self.decoder.discarded())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl FrameStream {
    /// Wraps a chunk stream. The token abandons the stream when cancelled.
    #[must_use]
    pub fn new(chunks: ChunkStream, token: CancellationToken) -> Self {
        Self {
            chunks,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            token,
            finished: false,
        }
    }

    /// Builds a frame stream from any chunk stream. Handy for tests.
    #[must_use]
    pub fn from_chunks<S>(chunks: S, token: CancellationToken) -> Self
    where
        S: Stream<Item = ConsoleResult<Vec<u8>>> + Send + 'static,
    {
        Self::new(Box::pin(chunks), token)
    }

    /// Reads the next frame.
    ///
    /// Frames already decoded but not yet returned are dropped once the token
    /// is cancelled. After `Closed`, `Cancelled` or `Failed` every further
    /// call returns `Closed` or `Cancelled`.
    pub async fn next_frame(&mut self) -> FrameRead {
        loop {
            if self.token.is_cancelled() {
                self.ready.clear();
                return FrameRead::Cancelled;
            }
            if let Some(frame) = self.ready.pop_front() {
                return FrameRead::Frame(frame);
            }
            if self.finished {
                return FrameRead::Closed;
            }

            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    self.ready.clear();
                    return FrameRead::Cancelled;
                }
                next = self.chunks.next() => next,
            };

            match next {
                Some(Ok(chunk)) => self.ready.extend(self.decoder.push(&chunk)),
                Some(Err(err)) => {
                    self.finished = true;
                    self.decoder.finish();
                    return FrameRead::Failed(err);
                }
                None => {
                    self.finished = true;
                    self.decoder.finish();
                }
            }
        }
    }

    /// Number of frames the decoder dropped so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.decoder.discarded()
    }
}
