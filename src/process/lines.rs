/// Line splitter for child output. Bytes arrive in arbitrary chunks; text
/// leaves one line at a time with its trailing newline kept.

/// Longest line held back before it is emitted in pieces.
pub const MAX_LINE_LEN: usize = 64 * 1024;

pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_LEN)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self { pending: Vec::new(), max_line: max_line.max(4) }
    }

    /// Feed bytes, get back every line they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).into_owned());
            } else if self.pending.len() > self.max_line {
                let cut = char_boundary(&self.pending, self.max_line);
                let piece: Vec<u8> = self.pending.drain(..cut).collect();
                lines.push(String::from_utf8_lossy(&piece).into_owned());
            } else {
                break;
            }
        }
        lines
    }

    /// Take whatever partial line is left (used at EOF).
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Largest index <= `limit` that does not split a UTF-8 sequence.
fn char_boundary(bytes: &[u8], limit: usize) -> usize {
    let mut cut = limit.min(bytes.len());
    while cut > 0 && cut < bytes.len() && bytes[cut] & 0xC0 == 0x80 {
        cut -= 1;
    }
    if cut == 0 { limit.min(bytes.len()) } else { cut }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_keep_newline() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"hello\nworld\n"), vec!["hello\n", "world\n"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"hel").is_empty());
        assert_eq!(buf.push(b"lo\nwo"), vec!["hello\n"]);
        assert_eq!(buf.flush(), Some("wo".to_string()));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_long_line_split_on_char_boundary() {
        let mut buf = LineBuffer::with_max_line(4);
        // Byte 4 is the second half of 'é', so the piece stops before it.
        let lines = buf.push("aaaéb".as_bytes());
        assert_eq!(lines, vec!["aaa"]);
        assert_eq!(buf.flush(), Some("éb".to_string()));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"bad \xff byte\n");
        assert_eq!(lines, vec!["bad \u{FFFD} byte\n"]);
    }

    #[test]
    fn test_crlf_is_left_alone() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"dos\r\n"), vec!["dos\r\n"]);
    }
}
