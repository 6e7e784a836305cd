//! Line reassembly and classification for the chat event stream.
//!
//! The body arrives in arbitrary fragments. [`LineDecoder`] keeps the trailing
//! partial line between reads and only hands out lines whose terminator has
//! been seen; [`classify_line`] turns one such line into [`StreamEvent`]s.

use serde::Deserialize;

use crate::models::deserialize_opt_id;

const DATA_PREFIX: &str = "data:";

/// A single parsed unit off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    Done {
        message_id: Option<String>,
        session_id: Option<String>,
    },
    /// The server gave up generating the reply mid-stream.
    ServerError(String),
    /// Not a recognizable payload. Ignored by the consumer.
    Malformed,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default, alias = "messageId", deserialize_with = "deserialize_opt_id")]
    message_id: Option<String>,
    #[serde(default, alias = "sessionId", deserialize_with = "deserialize_opt_id")]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Splits a byte stream into complete lines.
///
/// Works on bytes so that a multi-byte character split across two reads is
/// only decoded once the whole line is present.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment and returns every line it completed, without terminators.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(fragment);

        let mut start = 0;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.buffer[start..end];
            if let [head @ .., b'\r'] = line {
                line = head;
            }
            lines.push(decode(line));
            start = end + 1;
            search_from = start;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Bytes of the line still waiting for its terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Ends the stream: the unterminated remainder, if any, counts as a line.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buffer);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(decode(&rest))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Classifies one complete line.
///
/// Blank separators and `:` keepalive comments produce nothing. A payload with
/// both `content` and `done` yields the delta first.
pub fn classify_line(line: &str) -> Vec<StreamEvent> {
    if line.trim().is_empty() || line.starts_with(':') {
        return Vec::new();
    }
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return vec![StreamEvent::Malformed];
    };
    let json = rest.strip_prefix(' ').unwrap_or(rest);

    let payload: StreamPayload = match serde_json::from_str(json) {
        Ok(p) => p,
        Err(_) => return vec![StreamEvent::Malformed],
    };

    let mut events = Vec::with_capacity(2);
    if let Some(content) = payload.content.filter(|c| !c.is_empty()) {
        events.push(StreamEvent::ContentDelta(content));
    }
    if let Some(message) = payload.error {
        events.push(StreamEvent::ServerError(message));
    } else if payload.done {
        events.push(StreamEvent::Done {
            message_id: payload.message_id,
            session_id: payload.session_id,
        });
    }
    if events.is_empty() {
        events.push(StreamEvent::Malformed);
    }
    events
}
