//! Channel-marker stripping for node output.
//!
//! Some model families emit multi-channel control markers of the form
//! `<|channel|>analysis<|message|>…<|end|><|channel|>final<|message|>…`.
//! Clients should only ever see the final-channel payload.

const FINAL_MARKER: &str = "<|channel|>final<|message|>";

/// Strip control markers, keeping only the final-channel payload. Text
/// without markers passes through unchanged.
pub fn strip_channel_markers(text: &str) -> String {
    if !text.contains("<|") {
        return text.to_string();
    }

    // With an explicit final channel, everything before it is scratch work.
    let tail = match text.rfind(FINAL_MARKER) {
        Some(pos) => &text[pos + FINAL_MARKER.len()..],
        None => text,
    };

    // Drop any remaining <|…|> tokens.
    let mut out = String::with_capacity(tail.len());
    let mut rest = tail;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        match rest[start..].find("|>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                // Unterminated marker, likely split mid-stream; drop it.
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(strip_channel_markers("hello world"), "hello world");
    }

    #[test]
    fn test_keeps_final_channel_only() {
        let raw = "<|channel|>analysis<|message|>thinking...<|end|><|channel|>final<|message|>Hello!";
        assert_eq!(strip_channel_markers(raw), "Hello!");
    }

    #[test]
    fn test_strips_trailing_end_marker() {
        let raw = "<|channel|>final<|message|>Hello!<|end|>";
        assert_eq!(strip_channel_markers(raw), "Hello!");
    }

    #[test]
    fn test_strips_stray_markers_without_final_channel() {
        let raw = "Hello <|return|>world";
        assert_eq!(strip_channel_markers(raw), "Hello world");
    }

    #[test]
    fn test_unterminated_marker_dropped() {
        assert_eq!(strip_channel_markers("Hello<|chan"), "Hello");
    }
}
