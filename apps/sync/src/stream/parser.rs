//! Incremental server-sent-event framing.
//!
//! Bytes arrive in arbitrary chunks; the parser buffers the partial line and
//! only interprets complete `\n`-terminated lines, so the frames produced are
//! independent of where the chunk boundaries fall.

use serde_json::Value;

use crate::errors::ApiError;

/// One logical event: everything between two blank lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// At an event boundary; nothing collected for the next event yet.
    AwaitingEvent,
    /// At least one `event:`/`data:` field seen since the last boundary.
    AccumulatingEvent,
}

#[derive(Debug)]
pub struct SseParser {
    state: ParserState,
    /// Bytes of the current, not yet terminated line.
    line: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitingEvent,
            line: Vec::new(),
            event: None,
            data: Vec::new(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Consumes one chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
            if line.is_empty() {
                frames.extend(self.take_frame());
            } else {
                self.field(line);
            }
        }
        frames
    }

    /// Flushes whatever is buffered when the connection closes, tolerating a
    /// stream that ends without the trailing blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let line = std::mem::take(&mut self.line);
        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
        if !line.is_empty() {
            self.field(line);
        }
        self.take_frame()
    }

    fn field(&mut self, raw: &[u8]) {
        // '\n' never occurs inside a multi-byte UTF-8 sequence, so a complete
        // line is always a complete piece of text.
        let line = String::from_utf8_lossy(raw);
        if line.starts_with(':') {
            return;
        }

        let (name, value) = match line.find(':') {
            Some(i) => {
                let value = &line[i + 1..];
                (&line[..i], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (&line[..], ""),
        };

        match name {
            "event" => {
                self.event = Some(value.to_string());
                self.state = ParserState::AccumulatingEvent;
            }
            "data" => {
                self.data.push(value.to_string());
                self.state = ParserState::AccumulatingEvent;
            }
            // id:, retry: and unknown fields carry nothing we act on.
            _ => {}
        }
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.state == ParserState::AwaitingEvent {
            return None;
        }
        self.state = ParserState::AwaitingEvent;
        Some(SseFrame {
            event: self.event.take().filter(|e| !e.is_empty()),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// A frame after JSON decoding and routing by event name.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress {
        progress: u8,
        message: Option<String>,
    },
    Complete(Value),
    /// The server reported a failure on the stream.
    Error(String),
    /// Any other event name (`notification`, `initial`, `connected`, `analysis_id`, ...).
    Message { event: String, payload: Value },
}

impl SseFrame {
    /// Decodes the data as JSON and routes the frame.
    ///
    /// Without an `event:` line the name comes from the payload's `type`
    /// field, then from the presence of a numeric `progress`, else `message`.
    pub fn into_event(self) -> Result<StreamEvent, ApiError> {
        let payload = if self.data.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str::<Value>(&self.data).map_err(|e| {
                ApiError::framing(format!(
                    "Invalid JSON in '{}' event: {e}",
                    self.event.as_deref().unwrap_or("message")
                ))
            })?
        };

        let name = self
            .event
            .or_else(|| {
                payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                if payload.get("progress").is_some_and(Value::is_number) {
                    "progress".to_string()
                } else {
                    "message".to_string()
                }
            });

        Ok(match name.as_str() {
            "progress" => StreamEvent::Progress {
                progress: payload
                    .get("progress")
                    .and_then(Value::as_f64)
                    .map(|p| p.clamp(0.0, 100.0).round() as u8)
                    .unwrap_or(0),
                message: payload
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "complete" => StreamEvent::Complete(payload),
            "error" => StreamEvent::Error(
                payload
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| payload.as_str())
                    .unwrap_or("Stream reported an error")
                    .to_string(),
            ),
            _ => StreamEvent::Message {
                event: name,
                payload,
            },
        })
    }
}
