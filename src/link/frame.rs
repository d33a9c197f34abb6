//! NUL-delimited framing for the INO serial link.

use thiserror::Error;

/// Longest frame the board ever emits. Anything longer is line noise.
pub const MAX_FRAME_LEN: usize = 512;

const TERMINATOR: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame exceeds 512 bytes")]
    Overflow,
}

/// Encode one outbound frame. Several commands may be packed into `text`
/// separated by `;`.
pub fn encode_frame(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() + 2);
    frame.extend_from_slice(text.as_bytes());
    frame.push(b';');
    frame.push(TERMINATOR);
    frame
}

/// Reassembles inbound frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Set while skipping the tail of an oversized frame.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, trimmed. Empty frames are skipped. An error means
    /// one frame was dropped; decoding continues with the following one.
    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == TERMINATOR) else {
                if self.buf.len() > MAX_FRAME_LEN {
                    self.buf.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Err(FrameError::Overflow));
                    }
                }
                return None;
            };

            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let body = &raw[..raw.len() - 1];
            if body.len() > MAX_FRAME_LEN {
                return Some(Err(FrameError::Overflow));
            }
            let text = match std::str::from_utf8(body) {
                Ok(text) => text.trim(),
                Err(_) => return Some(Err(FrameError::InvalidUtf8)),
            };
            if text.is_empty() {
                continue;
            }
            return Some(Ok(text.to_string()));
        }
    }

    /// Drop buffered bytes, e.g. after the link was reopened.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_appends_terminator() {
        assert_eq!(encode_frame("s 200"), b"s 200;\0".to_vec());
    }

    #[test]
    fn test_split_reads_reassemble() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"tick:1, T_a:2");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"500\0 \0version: 1\0");
        assert_eq!(decoder.next_frame(), Some(Ok("tick:1, T_a:2500".to_string())));
        assert_eq!(decoder.next_frame(), Some(Ok("version: 1".to_string())));
        assert_eq!(decoder.next_frame(), None);
    }

    #[test]
    fn test_invalid_utf8_is_dropped_alone() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xff, 0xfe, 0x00]);
        decoder.push(b"ok\0");
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::InvalidUtf8)));
        assert_eq!(decoder.next_frame(), Some(Ok("ok".to_string())));
    }

    #[test]
    fn test_oversized_frame_skipped_to_next_terminator() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&vec![b'x'; MAX_FRAME_LEN + 10]);
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::Overflow)));
        decoder.push(b"still the same frame\0next\0");
        assert_eq!(decoder.next_frame(), Some(Ok("next".to_string())));
        assert_eq!(decoder.buffered(), 0);
    }
}
