//! Binary frame format.
//!
//! Frame layout (5 bytes header + payload):
//!
//! ```text
//! +--------+-------------+----------------------+
//! |  type  | payload_len | payload              |
//! | 1 byte |   4 bytes   | payload_len bytes    |
//! +--------+-------------+----------------------+
//! ```
//!
//! The length is explicit so payloads may carry arbitrary binary content,
//! including sealed (encrypted) bytes.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed frame header in bytes (1 + 4 = 5).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HandshakeInit = 0x01,
    HandshakeResponse = 0x02,
    RpcCall = 0x10,
    RpcResponse = 0x11,
    RpcError = 0x12,
    Subscribe = 0x20,
    Event = 0x21,
    Heartbeat = 0x30,
    Close = 0xFF,
}

impl MessageType {
    /// Returns the single-byte wire tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0x01 => Ok(MessageType::HandshakeInit),
            0x02 => Ok(MessageType::HandshakeResponse),
            0x10 => Ok(MessageType::RpcCall),
            0x11 => Ok(MessageType::RpcResponse),
            0x12 => Ok(MessageType::RpcError),
            0x20 => Ok(MessageType::Subscribe),
            0x21 => Ok(MessageType::Event),
            0x30 => Ok(MessageType::Heartbeat),
            0xFF => Ok(MessageType::Close),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Returns whether payloads of this type are sealed once a session key
    /// is established.
    pub fn is_sealed(self) -> bool {
        matches!(
            self,
            MessageType::RpcCall
                | MessageType::RpcResponse
                | MessageType::RpcError
                | MessageType::Event
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::HandshakeInit => "HANDSHAKE_INIT",
            MessageType::HandshakeResponse => "HANDSHAKE_RESPONSE",
            MessageType::RpcCall => "RPC_CALL",
            MessageType::RpcResponse => "RPC_RESPONSE",
            MessageType::RpcError => "RPC_ERROR",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Event => "EVENT",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Close => "CLOSE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub msg_type: MessageType,
    /// Frame payload (JSON, or sealed JSON).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(msg_type: MessageType, payload: Bytes) -> Self {
        Self { msg_type, payload }
    }

    /// Creates a frame with an empty payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Bytes::new())
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(
        msg_type: MessageType,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(msg_type, Bytes::from(payload)))
    }

    /// Parses the payload as JSON.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(payload)?)
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(payload_len).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let msg_type = MessageType::from_u8(buf[0])?;
        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total_len = FRAME_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        Ok(Some(Self { msg_type, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [MessageType; 9] = [
        MessageType::HandshakeInit,
        MessageType::HandshakeResponse,
        MessageType::RpcCall,
        MessageType::RpcResponse,
        MessageType::RpcError,
        MessageType::Subscribe,
        MessageType::Event,
        MessageType::Heartbeat,
        MessageType::Close,
    ];

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::HandshakeInit.as_u8(), 0x01);
        assert_eq!(MessageType::HandshakeResponse.as_u8(), 0x02);
        assert_eq!(MessageType::RpcCall.as_u8(), 0x10);
        assert_eq!(MessageType::RpcResponse.as_u8(), 0x11);
        assert_eq!(MessageType::RpcError.as_u8(), 0x12);
        assert_eq!(MessageType::Subscribe.as_u8(), 0x20);
        assert_eq!(MessageType::Event.as_u8(), 0x21);
        assert_eq!(MessageType::Heartbeat.as_u8(), 0x30);
        assert_eq!(MessageType::Close.as_u8(), 0xFF);

        for ty in ALL_TYPES {
            assert_eq!(MessageType::from_u8(ty.as_u8()).unwrap(), ty);
        }
    }

    #[test]
    fn test_sealed_types() {
        let sealed: Vec<_> = ALL_TYPES.iter().filter(|t| t.is_sealed()).collect();
        assert_eq!(sealed.len(), 4);
        assert!(!MessageType::HandshakeInit.is_sealed());
        assert!(!MessageType::Heartbeat.is_sealed());
        assert!(!MessageType::Close.is_sealed());
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(r#"{"id":"1","method":"add","args":[3,4]}"#);
        let frame = Frame::new(MessageType::RpcCall, payload.clone());

        let mut buf = frame.encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + payload.len());
        assert_eq!(buf[0], 0x10);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, MessageType::RpcCall);
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_binary_payload() {
        // Newlines and NULs must survive; framing is not delimiter based.
        let payload = Bytes::from(vec![0u8, b'\n', 0xFF, b'\n', 0x7F]);
        let frame = Frame::new(MessageType::Event, payload.clone());

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = BytesMut::from(&b"\x42\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownMessageType(0x42))
        ));
    }

    #[test]
    fn test_incomplete_frame() {
        // Header incomplete
        let mut buf = BytesMut::from(&b"\x10\x00\x00"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        // Header complete, payload incomplete
        let mut buf = BytesMut::from(&b"\x10\x00\x00\x00\x04ab"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"cd");
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"abcd");
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let frame = Frame::new(MessageType::RpcCall, Bytes::from(huge_payload));
        let result = frame.encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));

        // Declared length over the cap is rejected before buffering the body
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        buf.put_u32(MAX_PAYLOAD_SIZE + 1);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::empty(MessageType::Heartbeat);
        let mut buf = frame.encode().unwrap();
        assert_eq!(buf.as_ref(), b"\x30\x00\x00\x00\x00");

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, MessageType::Heartbeat);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_frame_from_json() {
        #[derive(serde::Serialize)]
        struct TestMsg {
            value: i32,
        }
        let frame = Frame::from_json(MessageType::RpcResponse, &TestMsg { value: 42 }).unwrap();
        let payload_str = std::str::from_utf8(&frame.payload).unwrap();
        assert_eq!(payload_str, r#"{"value":42}"#);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let frame1 = Frame::new(MessageType::RpcCall, Bytes::from(r#"{"id":"1"}"#));
        let frame2 = Frame::empty(MessageType::Close);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame1.encode().unwrap());
        buf.extend_from_slice(&frame2.encode().unwrap());

        let decoded1 = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded1, frame1);

        let decoded2 = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded2.msg_type, MessageType::Close);

        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }
}
