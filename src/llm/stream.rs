//! Server-sent-event decoding for streamed chat completions.
//!
//! Kept free of any I/O so the decoding rules can be exercised line by line.

use serde::Deserialize;
use serde_json::Value;

use crate::error::GenerationError;

/// The two accumulation buffers for one request attempt.
///
/// Both only ever grow by append, in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub content: String,
    pub reasoning_content: String,
    /// Delta events successfully decoded.
    pub chunks: usize,
}

/// What the caller should do after feeding a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// `[DONE]` sentinel seen; stop decoding this response.
    Done,
}

/// Providers send `choices: null` on keep-alive events and `error` as either an object
/// or a bare string.
#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Option<Vec<StreamChoice>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn upstream_error_message(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

impl CompletionResult {
    /// Fold one SSE line into the buffers.
    ///
    /// Non-data lines and malformed JSON payloads are skipped. Only an explicit error
    /// object inside the stream fails the attempt.
    pub fn feed_line(&mut self, line: &str) -> Result<LineOutcome, GenerationError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(LineOutcome::Continue);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(LineOutcome::Continue);
        }
        if payload == "[DONE]" {
            return Ok(LineOutcome::Done);
        }

        let event = match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed stream delta");
                return Ok(LineOutcome::Continue);
            }
        };

        if let Some(error) = &event.error {
            return Err(GenerationError::Stream(upstream_error_message(error)));
        }

        let Some(delta) = event
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
        else {
            return Ok(LineOutcome::Continue);
        };

        if let Some(text) = delta.content {
            self.content.push_str(&text);
        }
        match (delta.reasoning_content, delta.reasoning) {
            (Some(text), _) => self.reasoning_content.push_str(&text),
            (None, Some(text)) => self.reasoning_content.push_str(&text),
            (None, None) => {}
        }
        self.chunks += 1;
        Ok(LineOutcome::Continue)
    }

    /// `content` if non-empty, otherwise `reasoning_content`; both empty is an error.
    pub fn finish(self) -> Result<String, GenerationError> {
        if !self.content.is_empty() {
            Ok(self.content)
        } else if !self.reasoning_content.is_empty() {
            Ok(self.reasoning_content)
        } else {
            Err(GenerationError::EmptyResponse)
        }
    }
}

/// Splits an arbitrary byte stream into complete lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).to_string());
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).to_string())
        }
    }
}
