//! # kontract-protocol
//!
//! Wire protocol implementation for kontract.
//!
//! This crate provides:
//! - Typed binary framing (one tag byte, explicit payload length)
//! - AEAD sealing of RPC and event payloads with per-purpose keys
//! - JSON message types for handshakes, calls, responses and change events
//! - Stable error codes shared by server and client

pub mod cipher;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use cipher::{derive_key, random_nonce, CipherSuite, Sealed, SessionKeys, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use codec::{Decoder, Encoder};
pub use error::{CipherError, ErrorCode, ProtocolError};
pub use frame::{Frame, MessageType, FRAME_HEADER_SIZE};
pub use message::{
    ChangeEvent, ChangeKind, EventMessage, HandshakeInit, HandshakeResponse, RpcCall, RpcEnvelope,
    RpcError, RpcResponse, Subscribe,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the kontract server.
pub const DEFAULT_PORT: u16 = 8787;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
