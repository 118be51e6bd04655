//! Encoder and decoder for frames and messages.
//!
//! Once a connection has negotiated [`SessionKeys`], both sides install them
//! and every RPC/EVENT payload is sealed on encode and opened on decode.
//! Handshake, subscribe, heartbeat and close frames stay in plaintext.

use crate::cipher::SessionKeys;
use crate::error::ProtocolError;
use crate::frame::{Frame, MessageType};
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    keys: Option<SessionKeys>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs session keys; later sealed-type frames are encrypted.
    pub fn install_keys(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
    }

    pub fn is_sealing(&self) -> bool {
        self.keys.is_some()
    }

    /// Encodes a JSON-serializable value into a frame of the given type.
    pub fn encode_json<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        value: &T,
    ) -> Result<BytesMut, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        self.encode_payload(msg_type, payload)
    }

    /// Encodes a frame with no payload.
    pub fn encode_empty(&self, msg_type: MessageType) -> Result<BytesMut, ProtocolError> {
        Frame::empty(msg_type).encode()
    }

    fn encode_payload(
        &self,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<BytesMut, ProtocolError> {
        let payload = match &self.keys {
            Some(keys) if msg_type.is_sealed() => keys.seal(msg_type, &payload)?,
            _ => payload,
        };
        Frame::new(msg_type, Bytes::from(payload)).encode()
    }
}

/// Decodes frames from a byte stream.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    keys: Option<SessionKeys>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            keys: None,
        }
    }

    /// Installs session keys; later sealed-type frames are decrypted.
    pub fn install_keys(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Sealed payloads are returned opened. A payload that fails to open
    /// yields [`ProtocolError::Cipher`]; the frame is consumed either way.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let frame = match Frame::decode(&mut self.buffer)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        match &self.keys {
            Some(keys) if frame.msg_type.is_sealed() => {
                let plain = keys.open(frame.msg_type, &frame.payload)?;
                Ok(Some(Frame::new(frame.msg_type, Bytes::from(plain))))
            }
            _ => Ok(Some(frame)),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-push stream formatting (`data: <json>` followed by a blank line).
pub mod sse {
    use super::*;

    const PREFIX: &str = "data: ";

    /// Formats one value as a push-stream record.
    pub fn format<T: serde::Serialize>(value: &T) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(value)?;
        Ok(format!("{}{}\n\n", PREFIX, json))
    }

    /// Parses one record produced by [`format`].
    ///
    /// Returns `Ok(None)` for lines that are not data records (comments,
    /// blank keep-alives).
    pub fn parse<T: serde::de::DeserializeOwned>(record: &str) -> Result<Option<T>, ProtocolError> {
        let line = record.trim_end_matches('\n');
        match line.strip_prefix(PREFIX) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSuite;
    use crate::error::CipherError;
    use crate::message::{ChangeEvent, RpcCall, RpcResponse};
    use serde_json::json;

    fn keys() -> SessionKeys {
        SessionKeys::derive(CipherSuite::ChaCha20Poly1305, b"master", b"cn", b"sn")
    }

    #[test]
    fn test_plain_encode_decode() {
        let call = RpcCall::new("42", "add", json!([3, 4]));
        let encoded = Encoder::new()
            .encode_json(MessageType::RpcCall, &call)
            .unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::RpcCall);
        let decoded: RpcCall = frame.parse().unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn test_sealed_encode_decode() {
        let mut encoder = Encoder::new();
        encoder.install_keys(keys());
        let mut decoder = Decoder::new();
        decoder.install_keys(keys());

        let response = RpcResponse::ok("1", json!({"sum": 7}));
        let encoded = encoder
            .encode_json(MessageType::RpcResponse, &response)
            .unwrap();

        // Ciphertext on the wire, not JSON
        assert!(!encoded.windows(3).any(|w| w == b"sum"));

        decoder.extend(&encoded);
        let frame = decoder.decode_frame().unwrap().unwrap();
        let decoded: RpcResponse = frame.parse().unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_unsealed_types_stay_plain() {
        let mut encoder = Encoder::new();
        encoder.install_keys(keys());

        let encoded = encoder.encode_empty(MessageType::Heartbeat).unwrap();
        assert_eq!(encoded.as_ref(), b"\x30\x00\x00\x00\x00");

        let sub = crate::message::Subscribe::new("1", "todos");
        let encoded = encoder.encode_json(MessageType::Subscribe, &sub).unwrap();
        assert!(encoded.windows(5).any(|w| w == b"todos"));
    }

    #[test]
    fn test_wrong_keys_fail_closed() {
        let mut encoder = Encoder::new();
        encoder.install_keys(keys());
        let mut decoder = Decoder::new();
        decoder.install_keys(SessionKeys::derive(
            CipherSuite::ChaCha20Poly1305,
            b"other",
            b"cn",
            b"sn",
        ));

        let encoded = encoder
            .encode_json(MessageType::Event, &ChangeEvent::insert("a", json!(1)))
            .unwrap();
        decoder.extend(&encoded);

        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Cipher(CipherError::DecryptionFailed)
        ));
        // Bad frame consumed; stream stays aligned
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let call = RpcCall::new("1", "ping", json!(null));
        let encoded = Encoder::new()
            .encode_json(MessageType::RpcCall, &call)
            .unwrap();

        let mut decoder = Decoder::new();

        // Feed partial data
        decoder.extend(&encoded[..3]);
        assert!(decoder.decode_frame().unwrap().is_none());

        // Feed the rest
        decoder.extend(&encoded[3..]);
        let decoded: RpcCall = decoder.decode_frame().unwrap().unwrap().parse().unwrap();
        assert_eq!(decoded.id, "1");
    }

    #[test]
    fn test_sse_format() {
        let event = ChangeEvent::delete("t1", None);
        let record = sse::format(&event).unwrap();
        assert_eq!(record, "data: {\"type\":\"delete\",\"id\":\"t1\"}\n\n");

        let parsed: ChangeEvent = sse::parse(&record).unwrap().unwrap();
        assert_eq!(parsed, event);

        assert!(sse::parse::<ChangeEvent>(": keep-alive\n\n")
            .unwrap()
            .is_none());
    }
}
