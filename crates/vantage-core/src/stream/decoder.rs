//! Line-oriented `event:` / `data:` framing for the run stream.
//!
//! The decoder owns a rolling byte buffer: every chunk is appended, complete
//! lines are split off on `\n`, and the trailing fragment is held back for the
//! next chunk. Working on bytes rather than `str` means a multi-byte UTF-8
//! character cut by a chunk boundary is reassembled before it is decoded.

use serde_json::Value;

/// Event name used for `data:` lines that arrive before any `event:` line.
pub const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    current_event: Option<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            if let Some(frame) = self.decode_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        frames
    }

    /// Flushes a final unterminated line once the body has closed.
    pub fn finish(mut self) -> Vec<Frame> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.decode_line(&line).into_iter().collect()
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn decode_line(&mut self, raw: &str) -> Option<Frame> {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return None;
        }

        let payload = line.strip_prefix("data:")?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        match serde_json::from_str::<Value>(payload) {
            Ok(data) => Some(Frame {
                event: self
                    .current_event
                    .clone()
                    .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
                data,
            }),
            Err(e) => {
                tracing::debug!(
                    event = "vantage.stream.data_dropped",
                    bytes = payload.len(),
                    error = %e,
                    "dropping undecodable data line"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_name_applies_to_following_data_lines() {
        let mut d = FrameDecoder::new();
        let frames = d.push(
            b"event: provider_complete\ndata: {\"provider\":\"a\"}\ndata: {\"provider\":\"b\"}\n",
        );
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.event == "provider_complete"));
        assert_eq!(frames[1].data, json!({"provider": "b"}));
    }

    #[test]
    fn test_fragment_held_back_across_chunks() {
        let mut d = FrameDecoder::new();
        assert!(d.push(b"event: run_started\ndata: {\"run_id\":").is_empty());
        assert!(d.pending() > 0);

        let frames = d.push(b"\"r1\",\"total_calls\":24}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "run_started");
        assert_eq!(frames[0].data["total_calls"], 24);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let line = "event: question_start\ndata: {\"question_text\":\"Qu'est-ce que ça?\"}\n";
        let bytes = line.as_bytes();
        let split = line.find('ç').unwrap() + 1; // inside the two-byte sequence

        let mut d = FrameDecoder::new();
        let mut frames = d.push(&bytes[..split]);
        frames.extend(d.push(&bytes[split..]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["question_text"], "Qu'est-ce que ça?");
    }

    #[test]
    fn test_malformed_json_is_swallowed() {
        let mut d = FrameDecoder::new();
        let frames = d.push(b"event: heartbeat\ndata: {not json\ndata: {\"message\":\"ok\"}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["message"], "ok");
    }

    #[test]
    fn test_crlf_comments_and_default_name() {
        let mut d = FrameDecoder::new();
        let frames = d.push(b": keepalive\r\ndata: {\"x\":1}\r\nid: 7\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, DEFAULT_EVENT);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut d = FrameDecoder::new();
        assert!(d.push(b"event: run_complete\ndata: {\"run_id\":\"r1\"}").is_empty());
        let frames = d.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "run_complete");
    }
}
