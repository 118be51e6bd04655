//! Persisted entry envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Absolute expiry for a TTL starting now; `0` means never.
///
/// A zero TTL is treated like no TTL.
pub(crate) fn expiry_for(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) if !ttl.is_zero() => {
            now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        }
        _ => 0,
    }
}

pub(crate) fn is_expired_at(expires_at: i64, now: i64) -> bool {
    expires_at != 0 && expires_at < now
}

/// A value plus its absolute expiry.
///
/// Persisted as `{"value": ..., "expiresAt": <epoch ms>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub value: Value,
    #[serde(default)]
    pub expires_at: i64,
}

impl Entry {
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: expiry_for(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        is_expired_at(self.expires_at, now)
    }
}
