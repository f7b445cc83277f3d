use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

pub const DONE: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.data.len() + 16);
        if let Some(id) = &self.id {
            buffer.put_slice(b"id: ");
            buffer.put_slice(id.as_bytes());
            buffer.put_u8(b'\n');
        }
        if let Some(event) = &self.event {
            buffer.put_slice(b"event: ");
            buffer.put_slice(event.as_bytes());
            buffer.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            buffer.put_slice(b"data: ");
            buffer.put_slice(line.as_bytes());
            buffer.put_u8(b'\n');
        }
        buffer.put_u8(b'\n');
        buffer.freeze()
    }
}

pub fn json_frame<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_string(value) {
        Ok(data) => SseEvent::data(data).to_bytes(),
        Err(_) => Bytes::new(),
    }
}

pub fn named_json_frame<T: Serialize>(event: &str, value: &T) -> Bytes {
    match serde_json::to_string(value) {
        Ok(data) => SseEvent::named(event, data).to_bytes(),
        Err(_) => Bytes::new(),
    }
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Incremental event-stream decoder. Lines may end in `\n`, `\r\n` or `\r`
/// and may be split anywhere across chunks, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    current: SseEvent,
    started: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        if !self.started {
            const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
            let n = self.pending.len().min(3);
            if self.pending[..n] == BOM[..n] {
                if n < 3 {
                    return Vec::new();
                }
                self.pending.drain(..3);
            }
            self.started = true;
        }

        let mut events = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            let Some(pos) = rest.iter().position(|&b| b == b'\n' || b == b'\r') else {
                break;
            };
            let skip = if rest[pos] == b'\r' {
                match rest.get(pos + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // A lone trailing `\r` may be the first half of `\r\n`.
                    None => break,
                }
            } else {
                1
            };
            let line = String::from_utf8_lossy(&rest[..pos]).into_owned();
            consumed += pos + skip;
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        self.pending.drain(..consumed);
        events
    }

    /// Flushes an event that was not followed by a blank line before EOF.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.take_line(&line);
        }
        self.take_event()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.current.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current.data.is_empty() && self.current.event.is_none() {
            self.current.id = None;
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }
}
