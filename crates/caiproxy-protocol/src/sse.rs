use bytes::Bytes;

/// Terminal frame closing every chat-completions stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";
/// Comment frame sent while a stream is idle.
pub const KEEPALIVE_FRAME: &str = ": keep-alive\n\n";

pub fn data_frame(payload: &str) -> Bytes {
    let mut frame = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(KEEPALIVE_FRAME.as_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental decoder for `text/event-stream` bodies. Comment lines are dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
            } else {
                self.take_line(&line);
            }
        }

        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line);
        }
        self.finish_event(&mut events);
        events
    }

    fn take_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}
