//! Line-delimited JSON framing over a raw byte stream.
//!
//! The child writes one JSON document per line, but reads from a pipe arrive in
//! arbitrary chunks. `StdioFramer` buffers the trailing partial line across
//! chunks and yields complete values in arrival order. Anything that is not
//! JSON (log lines, banners, progress output) is surfaced as `Frame::Noise`
//! and never ends the stream.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read size for each pull from the child's stdout.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on a single unterminated line. A child that streams this much
/// without a newline is not speaking the protocol; the buffer is discarded.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One complete segment of output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A well-formed JSON document.
    Message(serde_json::Value),
    /// A line that failed to parse as JSON.
    Noise(String),
}

/// Incremental newline splitter with JSON decoding.
#[derive(Debug, Default)]
pub struct StdioFramer {
    buf: Vec<u8>,
}

impl StdioFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and return every segment it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let Some(last_newline) = self.buf.iter().rposition(|b| *b == b'\n') else {
            if self.buf.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    buffered = self.buf.len(),
                    "discarding oversized unterminated line"
                );
                let dropped = std::mem::take(&mut self.buf);
                return vec![Frame::Noise(truncate_lossy(&dropped))];
            }
            return Vec::new();
        };

        let rest = self.buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buf, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(parse_segment)
            .collect()
    }

    /// Flush whatever remains after the stream ended.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buf);
        parse_segment(&rest)
    }
}

/// Decode one line. Blank lines produce nothing.
fn parse_segment(segment: &[u8]) -> Option<Frame> {
    let trimmed = segment.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice::<serde_json::Value>(trimmed) {
        Ok(value) => Some(Frame::Message(value)),
        Err(_) => Some(Frame::Noise(truncate_lossy(trimmed))),
    }
}

/// Lossy UTF-8 conversion, capped so noise never floods the logs.
fn truncate_lossy(bytes: &[u8]) -> String {
    const MAX_NOISE_CHARS: usize = 2000;
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > MAX_NOISE_CHARS {
        let mut cut: String = text.chars().take(MAX_NOISE_CHARS).collect();
        cut.push_str("...(truncated)");
        cut
    } else {
        text.into_owned()
    }
}

// ─── Stream Adapter ──────────────────────────────────────────────────────────

struct FrameState<R> {
    reader: R,
    framer: StdioFramer,
    queue: VecDeque<Frame>,
    chunk: Vec<u8>,
    eof: bool,
}

/// Turn a reader into a lazy, unbounded stream of frames.
///
/// The stream ends when the reader reaches EOF or fails; a final partial line
/// is flushed first.
pub fn frames<R>(reader: R) -> impl Stream<Item = Frame>
where
    R: AsyncRead + Unpin,
{
    let state = FrameState {
        reader,
        framer: StdioFramer::new(),
        queue: VecDeque::new(),
        chunk: vec![0u8; READ_CHUNK_SIZE],
        eof: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.queue.pop_front() {
                return Some((frame, st));
            }
            if st.eof {
                return None;
            }
            match st.reader.read(&mut st.chunk).await {
                Ok(0) => {
                    st.eof = true;
                    st.queue.extend(st.framer.finish());
                }
                Ok(n) => {
                    let completed = st.framer.push(&st.chunk[..n]);
                    st.queue.extend(completed);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "read failed, treating as end of stream");
                    st.eof = true;
                    st.queue.extend(st.framer.finish());
                }
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
