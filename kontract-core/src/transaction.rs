//! Session transactions.
//!
//! Every call runs inside one transaction:
//!
//! ```text
//! NEW --begin--> BEGUN --commit--> COMMITTED
//!                  |
//!                  +----abandon---> FAILED
//! ```
//!
//! Commit is the single terminal action that makes the session record
//! visible. An abandoned transaction writes nothing; side effects a handler
//! already made through storage are not undone.

use crate::error::CoreError;
use crate::permission::Perm;
use kontract_storage::{now_millis, SharedStorage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Owner used when the caller presents no identity.
pub const ANONYMOUS_OWNER: &str = "anonymous";

const SESSION_KEY_PREFIX: &str = "session:";

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    New,
    Begun,
    Committed,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::New => "NEW",
            TransactionState::Begun => "BEGUN",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Committed session, as persisted under `session:<sid>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub sid: String,
    pub owner: String,
    pub perm: Perm,
    pub committed_at: i64,
}

/// One call's unit of work.
#[derive(Debug, Clone)]
pub struct Transaction {
    sid: String,
    owner: String,
    perm: Perm,
    state: TransactionState,
    resumed: bool,
}

impl Transaction {
    /// Creates a transaction in the NEW state.
    pub fn new(sid: impl Into<String>, owner: impl Into<String>, perm: Perm) -> Self {
        Self {
            sid: sid.into(),
            owner: owner.into(),
            perm,
            state: TransactionState::New,
            resumed: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether the session id was presented by the caller.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            sid: self.sid.clone(),
            owner: self.owner.clone(),
            perm: self.perm,
            committed_at: now_millis(),
        }
    }
}

/// Opens, commits and abandons transactions against shared storage.
pub struct TransactionManager {
    storage: Arc<SharedStorage>,
    session_ttl: Option<Duration>,
}

impl TransactionManager {
    pub fn new(storage: Arc<SharedStorage>) -> Self {
        Self {
            storage,
            session_ttl: None,
        }
    }

    /// Sets how long committed session records stay resumable.
    pub fn with_session_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    fn session_key(sid: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, sid)
    }

    /// Begins a transaction.
    ///
    /// A missing or empty `owner` becomes [`ANONYMOUS_OWNER`]. Without a
    /// presented session id a fresh one is generated. A presented id must
    /// name a committed, unexpired session ([`CoreError::SessionExpired`]
    /// otherwise) owned by the same identity ([`CoreError::Forbidden`]
    /// otherwise). `perm` is the mask granted for this call.
    pub async fn begin(
        &self,
        owner: Option<&str>,
        presented_sid: Option<&str>,
        perm: Perm,
    ) -> Result<Transaction, CoreError> {
        let owner = owner
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(ANONYMOUS_OWNER);

        let mut tx = match presented_sid.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sid) => {
                let stored = self
                    .storage
                    .get(&Self::session_key(sid))
                    .await?
                    .ok_or_else(|| CoreError::SessionExpired {
                        sid: sid.to_string(),
                    })?;
                let record: SessionRecord = serde_json::from_value(stored)?;
                if record.owner != owner {
                    return Err(CoreError::Forbidden);
                }
                let mut tx = Transaction::new(sid, owner, perm);
                tx.resumed = true;
                tx
            }
            None => Transaction::new(uuid::Uuid::new_v4().to_string(), owner, perm),
        };

        tx.state = TransactionState::Begun;
        debug!(
            "transaction {} begun for {} ({})",
            tx.sid, tx.owner, tx.perm
        );
        Ok(tx)
    }

    /// Commits a BEGUN transaction, persisting its session record.
    ///
    /// If the record cannot be written the transaction moves to FAILED and
    /// the storage error is returned.
    pub async fn commit(&self, tx: &mut Transaction) -> Result<(), CoreError> {
        if tx.state != TransactionState::Begun {
            return Err(CoreError::InvalidState(format!(
                "cannot commit transaction {} in state {}",
                tx.sid, tx.state
            )));
        }

        let record = serde_json::to_value(tx.record())?;
        if let Err(e) = self
            .storage
            .set(&Self::session_key(&tx.sid), record, self.session_ttl)
            .await
        {
            tx.state = TransactionState::Failed;
            return Err(e.into());
        }

        tx.state = TransactionState::Committed;
        debug!("transaction {} committed", tx.sid);
        Ok(())
    }

    /// Abandons a BEGUN transaction. No-op in any other state.
    pub fn abandon(&self, tx: &mut Transaction) {
        if tx.state == TransactionState::Begun {
            tx.state = TransactionState::Failed;
            debug!("transaction {} abandoned", tx.sid);
        }
    }
}
