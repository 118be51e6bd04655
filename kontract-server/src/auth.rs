//! Handshake token authentication.
//!
//! Clients present a bearer token in `HANDSHAKE_INIT`. The server keeps only
//! SHA-256 hashes of accepted tokens.

use crate::config::AuthConfig;
use crate::error::ServerError;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Checks handshake tokens against configured hashes.
#[derive(Debug, Clone, Default)]
pub struct TokenValidator {
    required: bool,
    /// Lowercase hex SHA-256 digests.
    valid_hashes: HashSet<String>,
}

impl TokenValidator {
    pub fn new(required: bool, hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            required,
            valid_hashes: hashes
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.required, config.token_hashes.iter().cloned())
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn token_count(&self) -> usize {
        self.valid_hashes.len()
    }

    /// Returns whether `token` hashes to a configured value.
    pub fn validate(&self, token: &str) -> bool {
        !self.valid_hashes.is_empty() && self.valid_hashes.contains(&Self::hash_token(token))
    }

    /// Decides whether a handshake may proceed.
    ///
    /// When auth is not required a missing token is accepted, but a token
    /// that is presented must still be valid.
    pub fn authenticate(&self, token: Option<&str>) -> Result<(), ServerError> {
        match token {
            Some(token) if self.validate(token) => Ok(()),
            Some(_) => Err(ServerError::AuthFailed("invalid token".to_string())),
            None if self.required => Err(ServerError::AuthFailed("token required".to_string())),
            None => Ok(()),
        }
    }

    /// SHA-256 of `token` as lowercase hex.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
