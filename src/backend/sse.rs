//! Incremental decoder for `data: {...}` event-stream lines.
//!
//! Network chunks can split a line (or a UTF-8 sequence) anywhere, so bytes
//! are buffered until a newline arrives and only complete lines are parsed.

use std::collections::VecDeque;
use std::fmt::Display;

use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{EventStream, StreamEvent};
use crate::error::TurnError;

const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

/// Parse one line. Non-data lines, malformed JSON and unknown event types
/// yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let wire: WireEvent = match serde_json::from_str(payload) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, line = %payload, "Skipping malformed stream line");
            return None;
        }
    };
    match wire.kind.as_str() {
        "text" => Some(StreamEvent::Text(wire.content)),
        "audio" => Some(StreamEvent::Audio(wire.content)),
        "done" => Some(StreamEvent::Done),
        "error" => Some(StreamEvent::Error(wire.content)),
        other => {
            debug!(kind = other, "Ignoring unknown stream event type");
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning events from every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            if let Some(ev) = parse_line(&String::from_utf8_lossy(&self.buffer[start..end])) {
                events.push(ev);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() {
            return Vec::new();
        }
        parse_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

struct DecodeState<S> {
    body: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Turn a byte stream into an ordered stream of events.
///
/// `prefix` holds bytes already read from `body` (the first chunk, read
/// while enforcing the first-byte timeout).
pub fn decode_event_stream<S, B, E>(prefix: Option<B>, body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut decoder = SseDecoder::new();
    let pending: VecDeque<StreamEvent> = prefix
        .map(|chunk| decoder.push(chunk.as_ref()))
        .unwrap_or_default()
        .into();
    let state = DecodeState {
        body: Box::pin(body),
        decoder,
        pending,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.pending.pop_front() {
                return Some((Ok(ev), st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.clear();
                    return Some((Err(TurnError::NetworkFailure(e.to_string())), st));
                }
                None => {
                    st.finished = true;
                    let events = st.decoder.finish();
                    st.pending.extend(events);
                }
            }
        }
    }))
}
