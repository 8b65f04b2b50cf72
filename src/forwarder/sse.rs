//! Incremental decoder for server-sent-event byte streams.

/// Buffers incoming bytes and yields the payload of each complete
/// `data: …` line. Handles CRLF and frames split across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns the data payloads completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.find('\n') {
            let line = self.buf[..newline].trim_end_matches('\r').to_string();
            self.buf.drain(..=newline);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"x\":1}\n\n");
        assert_eq!(payloads, vec![r#"{"x":1}"#]);
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"x\"").is_empty());
        let payloads = decoder.push(b":1}\ndata: [DONE]\n");
        assert_eq!(payloads, vec![r#"{"x":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_crlf_and_comment_lines() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b": heartbeat\r\ndata: hi\r\n\r\n");
        assert_eq!(payloads, vec!["hi"]);
    }

    #[test]
    fn test_event_lines_are_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"event: delta\ndata: x\n");
        assert_eq!(payloads, vec!["x"]);
    }
}
