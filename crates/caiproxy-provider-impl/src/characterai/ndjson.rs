use caiproxy_provider_core::{BackendError, BackendResult};
use serde::Deserialize;

/// Splits a byte stream into non-empty lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&line) {
                lines.push(line);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[derive(Debug, Deserialize)]
struct StreamingChunk {
    #[serde(default)]
    replies: Vec<StreamingReply>,
    #[serde(default)]
    is_final_chunk: bool,
    #[serde(default)]
    abort: bool,
}

#[derive(Debug, Deserialize)]
struct StreamingReply {
    #[serde(default)]
    text: String,
}

/// Turns cumulative reply snapshots into incremental fragments.
///
/// Snapshots that do not extend the text seen so far are skipped, so the
/// emitted fragments always concatenate to the accumulated text.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    text: String,
    finished: bool,
}

impl ReplyAccumulator {
    pub fn apply(&mut self, line: &str) -> BackendResult<Option<String>> {
        let chunk: StreamingChunk = serde_json::from_str(line)
            .map_err(|err| BackendError::Malformed(format!("streaming chunk: {err}")))?;
        if chunk.abort {
            self.finished = true;
            return Err(BackendError::EmptyReply);
        }

        let snapshot = chunk
            .replies
            .first()
            .map(|reply| reply.text.as_str())
            .unwrap_or_default();
        let delta = match snapshot.strip_prefix(self.text.as_str()) {
            Some(rest) if !rest.is_empty() => {
                let rest = rest.to_string();
                self.text.push_str(&rest);
                Some(rest)
            }
            _ => None,
        };

        if chunk.is_final_chunk {
            self.finished = true;
            if self.text.is_empty() {
                return Err(BackendError::EmptyReply);
            }
        }
        Ok(delta)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_survive_arbitrary_chunking() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"a\":").is_empty());
        let lines = decoder.push(b"1}\r\n\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(decoder.finish().as_deref(), Some("{\"c\""));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn cumulative_snapshots_become_deltas() {
        let mut acc = ReplyAccumulator::default();
        let lines = [
            r#"{"replies":[{"text":"Hel"}],"is_final_chunk":false}"#,
            r#"{"replies":[{"text":"Hello"}],"is_final_chunk":false}"#,
            r#"{"replies":[{"text":"Hello"}],"is_final_chunk":false}"#,
            r#"{"replies":[{"text":"Hello there"}],"is_final_chunk":true}"#,
        ];
        let deltas: Vec<String> = lines
            .iter()
            .filter_map(|line| acc.apply(line).unwrap())
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo", " there"]);
        assert_eq!(deltas.concat(), acc.text());
        assert!(acc.is_finished());
    }

    #[test]
    fn rewritten_snapshot_is_skipped() {
        let mut acc = ReplyAccumulator::default();
        assert_eq!(
            acc.apply(r#"{"replies":[{"text":"Hi"}]}"#).unwrap().as_deref(),
            Some("Hi")
        );
        assert_eq!(acc.apply(r#"{"replies":[{"text":"Yo"}]}"#).unwrap(), None);
        assert_eq!(acc.text(), "Hi");
    }

    #[test]
    fn empty_final_and_abort_are_errors() {
        let mut acc = ReplyAccumulator::default();
        assert_eq!(
            acc.apply(r#"{"replies":[],"is_final_chunk":true}"#),
            Err(BackendError::EmptyReply)
        );
        let mut acc = ReplyAccumulator::default();
        assert_eq!(acc.apply(r#"{"abort":true}"#), Err(BackendError::EmptyReply));
        let mut acc = ReplyAccumulator::default();
        assert!(matches!(
            acc.apply("not json"),
            Err(BackendError::Malformed(_))
        ));
    }
}
