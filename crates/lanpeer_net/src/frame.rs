//! Wire framing: `<TYPE> <LENGTH> <PAYLOAD>` frames.
//!
//! Frames are written back to back with no terminator; the declared length
//! is authoritative. Payloads are binary-safe and may contain the separator
//! byte. Header tokens are parsed incrementally so a header split across
//! several reads is reassembled.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{NetworkError, NetworkResult};

/// Byte separating the type token, the length token and the payload.
pub const SEPARATOR: u8 = b' ';

/// Upper bound on a single header token (type or decimal length).
pub const MAX_TOKEN_LEN: usize = 32;

/// The four frame types understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Handshake frame carrying the sender's display name.
    Greeting,
    /// Application text.
    Message,
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
}

impl FrameKind {
    /// The token written on the wire for this kind.
    pub fn token(self) -> &'static str {
        match self {
            Self::Greeting => "GREETING",
            Self::Message => "MESSAGE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Match a type token read off the wire.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"GREETING" => Some(Self::Greeting),
            b"MESSAGE" => Some(Self::Message),
            b"PING" => Some(Self::Ping),
            b"PONG" => Some(Self::Pong),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn greeting(name: &str) -> Self {
        Self::new(FrameKind::Greeting, Bytes::copy_from_slice(name.as_bytes()))
    }

    pub fn message(text: &str) -> Self {
        Self::new(FrameKind::Message, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// `PING 1 p`
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Bytes::from_static(b"p"))
    }

    /// `PONG 1 p`
    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Bytes::from_static(b"p"))
    }

    /// The payload as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecodeState {
    #[default]
    Type,
    Length(FrameKind),
    Body(FrameKind, usize),
}

/// Codec for the space-delimited, length-prefixed frame format.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec that rejects payloads longer than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Type,
            max_frame_size,
        }
    }

    /// The type of the frame currently being decoded, once its type token
    /// has been read.
    pub fn pending_kind(&self) -> Option<FrameKind> {
        match self.state {
            DecodeState::Type => None,
            DecodeState::Length(kind) | DecodeState::Body(kind, _) => Some(kind),
        }
    }

    /// True when no frame header has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Type
    }

    /// Split off the next separator-terminated token, consuming the separator.
    fn take_token(src: &mut BytesMut) -> NetworkResult<Option<BytesMut>> {
        match src.iter().position(|b| *b == SEPARATOR) {
            Some(pos) if pos > MAX_TOKEN_LEN => {
                Err(NetworkError::HeaderTooLong { max: MAX_TOKEN_LEN })
            }
            Some(pos) => {
                let token = src.split_to(pos);
                src.advance(1);
                Ok(Some(token))
            }
            None if src.len() > MAX_TOKEN_LEN => {
                Err(NetworkError::HeaderTooLong { max: MAX_TOKEN_LEN })
            }
            None => Ok(None),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> NetworkResult<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Type => {
                    let Some(token) = Self::take_token(src)? else {
                        return Ok(None);
                    };
                    let kind = FrameKind::from_token(&token).ok_or_else(|| {
                        NetworkError::UnknownFrameType(String::from_utf8_lossy(&token).into_owned())
                    })?;
                    self.state = DecodeState::Length(kind);
                }
                DecodeState::Length(kind) => {
                    let Some(token) = Self::take_token(src)? else {
                        return Ok(None);
                    };
                    let length = std::str::from_utf8(&token)
                        .ok()
                        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
                        .and_then(|s| s.parse::<usize>().ok())
                        .ok_or_else(|| {
                            NetworkError::InvalidLength(
                                String::from_utf8_lossy(&token).into_owned(),
                            )
                        })?;
                    if length > self.max_frame_size {
                        return Err(NetworkError::FrameTooLarge {
                            size: length,
                            max: self.max_frame_size,
                        });
                    }
                    self.state = DecodeState::Body(kind, length);
                }
                DecodeState::Body(kind, length) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(length).freeze();
                    self.state = DecodeState::Type;
                    return Ok(Some(Frame { kind, payload }));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> NetworkResult<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.is_idle() => Ok(None),
            None => Err(NetworkError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> NetworkResult<()> {
        let length = frame.payload.len();
        if length > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let length_token = length.to_string();
        let token = frame.kind.token();
        dst.reserve(token.len() + length_token.len() + 2 + length);
        dst.put_slice(token.as_bytes());
        dst.put_u8(SEPARATOR);
        dst.put_slice(length_token.as_bytes());
        dst.put_u8(SEPARATOR);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(&encode(Frame::greeting("Jane"))[..], b"GREETING 4 Jane");
        assert_eq!(&encode(Frame::message("hello"))[..], b"MESSAGE 5 hello");
        assert_eq!(&encode(Frame::ping())[..], b"PING 1 p");
        assert_eq!(&encode(Frame::pong())[..], b"PONG 1 p");
    }

    #[test]
    fn test_payload_with_separator_roundtrips() {
        let original = Frame::message("move 4 to 7 ");
        let mut buf = encode(original.clone());
        let decoded = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_utf8_length_counts_bytes() {
        let buf = encode(Frame::message("héllo"));
        assert!(buf.starts_with(b"MESSAGE 6 "));
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = encode(Frame::greeting("Jane"));
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "frame emitted early at byte {i}");
            } else {
                assert_eq!(result.unwrap(), Frame::greeting("Jane"));
            }
        }
        assert!(codec.is_idle());
    }

    #[test]
    fn test_pending_kind_after_type_token() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE 10 abc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.pending_kind(), Some(FrameKind::Message));
        assert!(!codec.is_idle());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"MESSAGE 5 helloPING 1 pPONG 1 p");
        let mut codec = FrameCodec::default();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::message("hello")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::ping()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::pong()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut buf = BytesMut::from(&b"MESSAGE 0 "[..]);
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = BytesMut::from(&b"HELLO 1 x"[..]);
        let result = FrameCodec::default().decode(&mut buf);
        assert!(matches!(result, Err(NetworkError::UnknownFrameType(t)) if t == "HELLO"));
    }

    #[test]
    fn test_non_numeric_length() {
        let mut buf = BytesMut::from(&b"MESSAGE five hello"[..]);
        let result = FrameCodec::default().decode(&mut buf);
        assert!(matches!(result, Err(NetworkError::InvalidLength(_))));
    }

    #[test]
    fn test_missing_length() {
        let mut buf = BytesMut::from(&b"MESSAGE  hello"[..]);
        let result = FrameCodec::default().decode(&mut buf);
        assert!(matches!(result, Err(NetworkError::InvalidLength(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::from(&b"MESSAGE 2048 "[..]);
        let result = FrameCodec::new(1024).decode(&mut buf);
        assert!(matches!(
            result,
            Err(NetworkError::FrameTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn test_header_token_without_separator() {
        let mut buf = BytesMut::from(&[b'A'; MAX_TOKEN_LEN + 1][..]);
        let result = FrameCodec::default().decode(&mut buf);
        assert!(matches!(result, Err(NetworkError::HeaderTooLong { .. })));
    }

    #[test]
    fn test_eof_mid_body_is_truncated() {
        let mut buf = BytesMut::from(&b"MESSAGE 10 abc"[..]);
        let mut codec = FrameCodec::default();
        let result = codec.decode_eof(&mut buf);
        assert!(matches!(result, Err(NetworkError::Truncated { buffered: 3 })));
    }

    #[test]
    fn test_eof_on_frame_boundary_is_clean() {
        let mut buf = BytesMut::from(&b"PING 1 p"[..]);
        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::ping()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        let result = FrameCodec::new(4).encode(Frame::message("hello"), &mut buf);
        assert!(matches!(result, Err(NetworkError::FrameTooLarge { .. })));
        assert!(buf.is_empty());
    }
}
