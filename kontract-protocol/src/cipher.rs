//! Authenticated encryption of frame payloads.
//!
//! A sealed payload is laid out as:
//!
//! ```text
//! +----------+----------------------+----------+
//! |  nonce   | ciphertext           |   tag    |
//! | 12 bytes | len(plaintext) bytes | 16 bytes |
//! +----------+----------------------+----------+
//! ```
//!
//! Every seal draws a fresh random nonce. The frame type byte is bound as
//! associated data, so a sealed RPC response cannot be replayed as an event.

use crate::error::CipherError;
use crate::frame::MessageType;
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{self, AeadInPlace, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Key length for both supported suites.
pub const KEY_LEN: usize = 32;

/// Nonce length for both supported suites.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length for both supported suites.
pub const TAG_LEN: usize = 16;

/// Supported AEAD constructions, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherSuite {
    /// All suites, most preferred first.
    pub const ALL: [CipherSuite; 2] = [CipherSuite::ChaCha20Poly1305, CipherSuite::Aes256Gcm];

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherSuite::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherSuite::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Picks the most preferred suite present in both lists.
    ///
    /// The stream construction wins whenever both sides have it; the
    /// block-cipher mode is the fallback.
    pub fn negotiate(
        offered: &[CipherSuite],
        enabled: &[CipherSuite],
    ) -> Result<CipherSuite, CipherError> {
        Self::ALL
            .into_iter()
            .find(|suite| offered.contains(suite) && enabled.contains(suite))
            .ok_or(CipherError::NoCommonSuite)
    }

    /// Encrypts `plaintext` under `key`, binding `aad`.
    pub fn encrypt(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = match self {
            CipherSuite::ChaCha20Poly1305 => {
                seal_in_place::<ChaCha20Poly1305>(key, &nonce, aad, &mut buffer)?
            }
            CipherSuite::Aes256Gcm => seal_in_place::<Aes256Gcm>(key, &nonce, aad, &mut buffer)?,
        };

        Ok(Sealed {
            nonce,
            ciphertext: buffer,
            tag,
        })
    }

    /// Decrypts a sealed payload.
    ///
    /// Fails closed: a wrong key, a modified ciphertext, a modified tag and
    /// mismatched associated data all yield the same
    /// [`CipherError::DecryptionFailed`], and no plaintext is returned.
    pub fn decrypt(&self, key: &[u8], sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut buffer = sealed.ciphertext.clone();
        match self {
            CipherSuite::ChaCha20Poly1305 => open_in_place::<ChaCha20Poly1305>(
                key,
                &sealed.nonce,
                aad,
                &mut buffer,
                &sealed.tag,
            )?,
            CipherSuite::Aes256Gcm => {
                open_in_place::<Aes256Gcm>(key, &sealed.nonce, aad, &mut buffer, &sealed.tag)?
            }
        }
        Ok(buffer)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherSuite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(CipherSuite::Aes256Gcm),
            other => Err(format!("unknown cipher suite: {}", other)),
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(())
}

fn seal_in_place<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN], CipherError> {
    check_key(key)?;
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength {
        expected: KEY_LEN,
        actual: key.len(),
    })?;
    let tag = cipher
        .encrypt_in_place_detached(aead::Nonce::<C>::from_slice(nonce), aad, buffer)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_slice());
    Ok(out)
}

fn open_in_place<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<(), CipherError> {
    // A wrong-length key is reported as a plain decryption failure so the
    // caller learns nothing about which input was bad.
    if key.len() != KEY_LEN {
        return Err(CipherError::DecryptionFailed);
    }
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::DecryptionFailed)?;
    cipher
        .decrypt_in_place_detached(
            aead::Nonce::<C>::from_slice(nonce),
            aad,
            buffer,
            aead::Tag::<C>::from_slice(tag),
        )
        .map_err(|_| CipherError::DecryptionFailed)
}

/// Output of one encryption: nonce, ciphertext and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Serializes to `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parses `nonce || ciphertext || tag`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < NONCE_LEN {
            return Err(CipherError::InvalidNonce);
        }
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::DecryptionFailed);
        }

        let (nonce_bytes, rest) = bytes.split_at(NONCE_LEN);
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_LEN);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);

        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
            tag,
        })
    }
}

/// Derives `len` bytes of key material from `secret` and a purpose label.
///
/// The first 32-byte block is `SHA-256(secret || context)`; further blocks
/// append a big-endian block counter before hashing. Output is truncated
/// to `len`.
pub fn derive_key(secret: &[u8], context: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;

    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(context);
        if counter > 0 {
            hasher.update(counter.to_be_bytes());
        }
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    out.truncate(len);
    out
}

/// Per-connection keys, one per purpose.
///
/// RPC traffic and pushed events are sealed under different keys so a
/// ciphertext from one channel never opens on the other.
#[derive(Clone)]
pub struct SessionKeys {
    suite: CipherSuite,
    rpc_key: [u8; KEY_LEN],
    event_key: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Derives the session keys from the shared master secret and both
    /// handshake nonces.
    pub fn derive(
        suite: CipherSuite,
        master_secret: &[u8],
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Self {
        let rpc = derive_key(
            master_secret,
            &purpose_context(b"kontract rpc", client_nonce, server_nonce),
            KEY_LEN,
        );
        let event = derive_key(
            master_secret,
            &purpose_context(b"kontract event", client_nonce, server_nonce),
            KEY_LEN,
        );

        let mut rpc_key = [0u8; KEY_LEN];
        rpc_key.copy_from_slice(&rpc);
        let mut event_key = [0u8; KEY_LEN];
        event_key.copy_from_slice(&event);

        Self {
            suite,
            rpc_key,
            event_key,
        }
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    fn key_for(&self, msg_type: MessageType) -> &[u8; KEY_LEN] {
        match msg_type {
            MessageType::Event => &self.event_key,
            _ => &self.rpc_key,
        }
    }

    /// Seals a payload for the given frame type.
    pub fn seal(&self, msg_type: MessageType, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let sealed = self
            .suite
            .encrypt(self.key_for(msg_type), plaintext, &[msg_type.as_u8()])?;
        Ok(sealed.to_bytes())
    }

    /// Opens a payload received in a frame of the given type.
    pub fn open(&self, msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>, CipherError> {
        let sealed = Sealed::from_bytes(payload)?;
        self.suite
            .decrypt(self.key_for(msg_type), &sealed, &[msg_type.as_u8()])
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

fn purpose_context(label: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(label.len() + 1 + client_nonce.len() + server_nonce.len());
    ctx.extend_from_slice(label);
    ctx.push(b':');
    ctx.extend_from_slice(client_nonce);
    ctx.extend_from_slice(server_nonce);
    ctx
}

/// Generates a fresh random handshake nonce.
pub fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
