//! Line framing for streamed HTTP bodies (NDJSON and SSE).

/// Accumulates body chunks and hands back complete, non-blank lines.
///
/// Splitting happens on raw `\n` bytes, so a multi-byte UTF-8 character cut
/// across two network chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        decode(&raw)
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"a\":").is_empty());
        assert_eq!(buffer.push(b"1}\n{\"b\""), vec!["{\"a\":1}".to_string()]);
        assert_eq!(buffer.push(b":2}\n"), vec!["{\"b\":2}".to_string()]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"data: x\r\n\r\n\ndata: y\n");
        assert_eq!(lines, vec!["data: x".to_string(), "data: y".to_string()]);
    }

    #[test]
    fn test_multibyte_character_across_chunks() {
        let mut buffer = LineBuffer::default();
        let text = "héllo\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(buffer.push(&text[..2]).is_empty());
        assert_eq!(buffer.push(&text[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_finish_returns_unterminated_tail() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"{\"done\":true}");
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
        assert!(buffer.finish().is_none());
    }
}
