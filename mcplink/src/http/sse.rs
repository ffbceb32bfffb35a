//! Incremental decoder for `text/event-stream` bodies, used by the HTTP client.
use tracing::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEvent {
    pub id: Option<String>,
    pub data: String,
}

/// Feed it body chunks as they arrive, get complete events back.
///
/// Only the `id` and `data` fields matter here.  Multiple `data` lines in one event are joined
/// with `\n`, comment lines are skipped, and the last event ID seen is remembered for
/// resumption.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    id: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = vec![];
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<DecodedEvent> {
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
            "id" => self.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "event" | "retry" => {}
            other => trace!(field = other, "Ignoring unknown SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<DecodedEvent> {
        let id = self.id.take();
        if id.is_some() {
            self.last_event_id = id.clone();
        }

        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(DecodedEvent { id, data })
    }
}
