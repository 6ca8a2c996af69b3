//! Server-Sent-Events frame parser.
//!
//! Turns an arbitrary chunking of the response body into whole `data:` lines and
//! decodes each into a [`RawProtocolEvent`]. Only the trailing incomplete line is
//! kept between calls, as bytes, so multi-byte characters split across chunks
//! survive.

use bytes::BytesMut;
use cinder_protocol::RawProtocolEvent;
use log::{debug, warn};

/// Payload of the end-of-stream sentinel line.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
    finished: bool,
    dropped: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event completed by it. Everything after
    /// the end-of-stream sentinel is discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawProtocolEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            if let Some(event) = self.decode_line(&line[..newline]) {
                events.push(event);
            }
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush a trailing line that was never newline-terminated. Call once the body
    /// has ended.
    pub fn finish(&mut self) -> Vec<RawProtocolEvent> {
        if self.finished || self.buffer.is_empty() {
            return Vec::new();
        }
        let line = self.buffer.split();
        self.decode_line(&line).into_iter().collect()
    }

    /// Whether the end-of-stream sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of data lines dropped because they did not decode.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Bytes held for the next call.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<RawProtocolEvent> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(payload) = line.strip_prefix(b"data:") else {
            // comments, `event:`/`id:`/`retry:` fields, blank separators
            return None;
        };
        let payload = payload.strip_prefix(b" ").unwrap_or(payload);

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.trim(),
            Err(e) => {
                self.dropped += 1;
                warn!("Dropping SSE data line with invalid UTF-8: {}", e);
                return None;
            }
        };

        if text.is_empty() {
            return None;
        }
        if text == DONE_SENTINEL {
            debug!("SSE end-of-stream sentinel received");
            self.finished = true;
            return None;
        }

        match serde_json::from_str::<RawProtocolEvent>(text) {
            Ok(event) => Some(event),
            Err(e) => {
                self.dropped += 1;
                warn!(
                    "Dropping malformed SSE frame ({}): {}",
                    e,
                    preview(text)
                );
                None
            }
        }
    }
}

/// First 200 characters of a line, for log output.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        ": keepalive\n",
        "data: {\"id\":\"1\",\"invocationId\":\"a\",\"partial\":true,\"content\":{\"parts\":[{\"text\":\"Burn sev\"}]}}\n",
        "\n",
        "event: message\n",
        "data: {\"id\":\"2\",\"invocationId\":\"a\",\"partial\":false,\"author\":\"burn_analyst\",\"content\":{\"parts\":[{\"text\":\"erity is high – très élevé.\"}]}}\r\n",
        "\r\n",
        "data: [DONE]\n",
    );

    fn parse_in_chunks(input: &[u8], chunk_size: usize) -> Vec<RawProtocolEvent> {
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for chunk in input.chunks(chunk_size) {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        assert!(parser.is_finished());
        events
    }

    #[test]
    fn test_single_chunk() {
        let events = parse_in_chunks(STREAM.as_bytes(), STREAM.len());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "1");
        assert_eq!(events[1].author.as_deref(), Some("burn_analyst"));
    }

    #[test]
    fn test_reassembly_is_independent_of_chunking() {
        let whole = parse_in_chunks(STREAM.as_bytes(), STREAM.len());
        // chunk sizes of 1..7 split lines and multi-byte characters at every offset
        for size in 1..=7 {
            assert_eq!(parse_in_chunks(STREAM.as_bytes(), size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn test_buffer_holds_only_trailing_line() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: {\"id\":\"x\"}\ndata: {\"id\"").len() == 1);
        assert_eq!(parser.pending(), "data: {\"id\"".len());
        assert!(parser.feed(b"").is_empty());
        let events = parser.feed(b":\"y\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "y");
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_lines_after_sentinel_are_ignored() {
        let input = b"data: {\"id\":\"a\"}\ndata: [DONE]\ndata: {\"id\":\"b\"}\ndata: {\"id\"";
        let whole = parse_in_chunks(input, input.len());
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].id, "a");
        for size in 1..=9 {
            assert_eq!(parse_in_chunks(input, size), whole, "chunk size {size}");
        }

        let mut parser = FrameParser::new();
        parser.feed(b"data: [DONE]\n");
        assert!(parser.feed(b"data: {\"id\":\"late\"}\n").is_empty());
        assert_eq!(parser.pending(), 0);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut parser = FrameParser::new();
        let events = parser.feed(b"data: {not json}\ndata: {\"id\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "ok");
        assert_eq!(parser.dropped(), 1);
        assert!(!parser.is_finished());
    }

    #[test]
    fn test_unterminated_final_line_is_flushed() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data:{\"id\":\"tail\"}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "tail");
        assert!(parser.finish().is_empty());
    }
}
