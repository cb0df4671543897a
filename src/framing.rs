//! Framed JSON stream extraction.
//!
//! Transports deliver arbitrary byte chunks. Each connection owns a
//! [`FrameBuffer`] that scans the stream byte by byte, tracking brace depth
//! and quoted-string state, and emits one complete `{…}` frame at a time.
//! Depth tracking over braces tolerates arbitrary payload content without
//! pre-agreed length framing; single- and double-quoted strings (and their
//! escapes) are skipped so payload text cannot unbalance the scan. A
//! trailing partial frame is retained across chunks.

use bytes::{Bytes, BytesMut};

use crate::observability;

/// Scanner state while consuming the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Between frames; waiting for an opening brace.
    Final,
    /// Inside a frame, outside any string.
    Json,
    /// Inside a double-quoted string.
    StrDq,
    /// Escape inside a double-quoted string.
    EscDq,
    /// Inside a single-quoted string.
    StrSq,
    /// Escape inside a single-quoted string.
    EscSq,
}

/// Per-connection receive buffer and frame scanner.
#[derive(Debug)]
pub struct FrameBuffer {
    data: BytesMut,
    state: BufferState,
    depth: u32,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            state: BufferState::Final,
            depth: 0,
        }
    }

    /// Consumes a chunk and returns every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for &byte in chunk {
            match self.state {
                BufferState::Final => match byte {
                    b'{' => {
                        self.depth = 1;
                        self.data.extend_from_slice(&[byte]);
                        self.state = BufferState::Json;
                    }
                    b' ' | b'\n' | b'\r' | b'\t' => {}
                    // Noise between frames is dropped.
                    _ => {}
                },
                BufferState::Json => {
                    self.data.extend_from_slice(&[byte]);
                    match byte {
                        b'{' => self.depth += 1,
                        b'}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                frames.push(self.data.split().freeze());
                                observability::record_frame();
                                self.state = BufferState::Final;
                            }
                        }
                        b'"' => self.state = BufferState::StrDq,
                        b'\'' => self.state = BufferState::StrSq,
                        _ => {}
                    }
                }
                BufferState::StrDq => {
                    self.data.extend_from_slice(&[byte]);
                    match byte {
                        b'\\' => self.state = BufferState::EscDq,
                        b'"' => self.state = BufferState::Json,
                        _ => {}
                    }
                }
                BufferState::EscDq => {
                    self.data.extend_from_slice(&[byte]);
                    self.state = BufferState::StrDq;
                }
                BufferState::StrSq => {
                    self.data.extend_from_slice(&[byte]);
                    match byte {
                        b'\\' => self.state = BufferState::EscSq,
                        b'\'' => self.state = BufferState::Json,
                        _ => {}
                    }
                }
                BufferState::EscSq => {
                    self.data.extend_from_slice(&[byte]);
                    self.state = BufferState::StrSq;
                }
            }
        }
        frames
    }

    /// Number of buffered bytes belonging to an unfinished frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.data.len()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &mut FrameBuffer, input: &[u8]) -> Vec<String> {
        buffer
            .push(input)
            .into_iter()
            .map(|f| String::from_utf8_lossy(&f).into_owned())
            .collect()
    }

    #[test]
    fn single_frame() {
        let mut buf = FrameBuffer::new();
        let frames = collect(&mut buf, br#"{"status": 1, "msg_id": "0000000001"}"#);
        assert_eq!(frames, vec![r#"{"status": 1, "msg_id": "0000000001"}"#]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut buf = FrameBuffer::new();
        let frames = collect(&mut buf, b"{\"a\":1} \n {\"b\":2}");
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut buf = FrameBuffer::new();
        assert!(collect(&mut buf, b"{\"a\": {\"b\":").is_empty());
        assert!(buf.pending() > 0);
        let frames = collect(&mut buf, b" 2}}");
        assert_eq!(frames, vec!["{\"a\": {\"b\": 2}}"]);
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let mut buf = FrameBuffer::new();
        let frames = collect(&mut buf, br#"{"a": "}}{{", "b": '}{'}"#);
        assert_eq!(frames, vec![r#"{"a": "}}{{", "b": '}{'}"#]);
    }

    #[test]
    fn escaped_quotes_do_not_close_strings() {
        let mut buf = FrameBuffer::new();
        let frames = collect(&mut buf, br#"{"a": "he said \"}\" ok"}"#);
        assert_eq!(frames, vec![r#"{"a": "he said \"}\" ok"}"#]);
    }

    #[test]
    fn whitespace_and_noise_between_frames_is_skipped() {
        let mut buf = FrameBuffer::new();
        let frames = collect(&mut buf, b"  \r\n xx {\"a\":1}");
        assert_eq!(frames, vec!["{\"a\":1}"]);
    }

    #[test]
    fn nested_command_envelope() {
        let mut buf = FrameBuffer::new();
        let wire = b"{{15}{core}{map______________}{int}{0000000007}{{0000000002}ab{0000000000}}}";
        let frames = collect(&mut buf, wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), wire);
    }

    #[test]
    fn byte_at_a_time_equals_whole_chunk() {
        let wire = br#"{"status": 9, "msg_json": {"v": "a}b"}, "msg_id": "0000000003"}{"x": 1}"#;
        let mut whole = FrameBuffer::new();
        let expected: Vec<_> = whole.push(wire);

        let mut dribble = FrameBuffer::new();
        let mut got = Vec::new();
        for &b in wire.iter() {
            got.extend(dribble.push(&[b]));
        }
        assert_eq!(got, expected);
        assert_eq!(got.len(), 2);
    }
}
