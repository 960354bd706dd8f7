use std::collections::VecDeque;

/// Longest reply line kept before it is cut off and reported as-is.
pub const MAX_LINE_LEN: usize = 256;

/// Reassembles reply lines from arbitrary byte chunks.
///
/// `\r` is stripped, surrounding whitespace trimmed and empty lines dropped
/// (microcontroller `println` output tends to carry both).
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.finish_line();
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_LINE_LEN {
                    self.finish_line();
                }
            }
        }
    }

    fn finish_line(&mut self) {
        let raw = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            self.ready.push_back(line);
        }
    }

    /// Next complete line, oldest first
    pub fn next_line(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Bytes of the unterminated line currently held
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut lines = LineBuffer::new();
        lines.push(b"42\r\n7\n");
        assert_eq!(lines.next_line().as_deref(), Some("42"));
        assert_eq!(lines.next_line().as_deref(), Some("7"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn holds_partial_line_until_terminator() {
        let mut lines = LineBuffer::new();
        lines.push(b"4");
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.partial_len(), 1);

        lines.push(b"2\n");
        assert_eq!(lines.next_line().as_deref(), Some("42"));
        assert_eq!(lines.partial_len(), 0);
    }

    #[test]
    fn drops_blank_lines() {
        let mut lines = LineBuffer::new();
        lines.push(b"\r\n\n  \n42\n");
        assert_eq!(lines.next_line().as_deref(), Some("42"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn cuts_overlong_garbage() {
        let mut lines = LineBuffer::new();
        lines.push(&vec![b'x'; MAX_LINE_LEN + 10]);
        let first = lines.next_line().unwrap();
        assert_eq!(first.len(), MAX_LINE_LEN);
        assert_eq!(lines.partial_len(), 10);
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let mut lines = LineBuffer::new();
        lines.push(&[0xFF, b'4', b'2', b'\n']);
        let line = lines.next_line().unwrap();
        assert!(line.ends_with("42"));
        assert_ne!(line, "42");
    }
}
