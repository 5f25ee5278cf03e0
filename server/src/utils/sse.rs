use bytes::{BufMut, Bytes, BytesMut};

/// One server-sent event. Only the fields the LLM providers actually emit
/// are modelled; `retry` and comment lines are consumed and dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        SseEvent {
            event: None,
            data: data.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        if let Some(event) = &self.event {
            buf.put_slice(b"event: ");
            buf.put_slice(event.as_bytes());
            buf.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            buf.put_slice(b"data: ");
            buf.put_slice(line.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

/// Incremental SSE frame parser. Feed it raw upstream chunks in arrival
/// order; it yields complete events and buffers partial lines (including
/// lines split inside a UTF-8 sequence or a CRLF pair) until the rest shows
/// up.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    pending: SseEvent,
    pending_has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((line_end, skip)) = self.next_line_break() {
            let line: Vec<u8> = self.buffer.drain(..line_end + skip).take(line_end).collect();
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                if self.pending_has_data || self.pending.event.is_some() {
                    events.push(std::mem::take(&mut self.pending));
                    self.pending_has_data = false;
                }
                continue;
            }
            self.consume_line(&line);
        }
        events
    }

    fn next_line_break(&self) -> Option<(usize, usize)> {
        for (i, &b) in self.buffer.iter().enumerate() {
            match b {
                b'\n' => return Some((i, 1)),
                b'\r' => {
                    // A trailing \r might be half of a \r\n split across
                    // chunks; wait for the next byte to decide.
                    return match self.buffer.get(i + 1) {
                        Some(b'\n') => Some((i, 2)),
                        Some(_) => Some((i, 1)),
                        None => None,
                    };
                }
                _ => {}
            }
        }
        None
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.pending_has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.pending_has_data = true;
            }
            "event" => self.pending.event = Some(value.to_string()),
            _ => {}
        }
    }
}
