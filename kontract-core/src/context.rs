//! Per-call context handed to route handlers.

use crate::error::CoreError;
use crate::permission::{self, Perm, Principal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Hook = Box<dyn FnOnce() + Send>;

/// Callbacks deferred until the call's transaction commits.
///
/// Clones share one queue. Hooks never run if the call fails, times out
/// or its commit fails.
#[derive(Clone, Default)]
pub struct CommitHooks(Arc<Mutex<Vec<Hook>>>);

impl CommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `hook` to run after commit.
    pub fn push(&self, hook: impl FnOnce() + Send + 'static) {
        self.0.lock().push(Box::new(hook));
    }

    /// Runs and drains the queued hooks in push order.
    pub fn run(&self) {
        let hooks = std::mem::take(&mut *self.0.lock());
        for hook in hooks {
            hook();
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CommitHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHooks")
            .field("pending", &self.len())
            .finish()
    }
}

impl PartialEq for CommitHooks {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Name and execution group of the route being called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteIdentity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egroup: Option<String>,
}

/// Everything a handler knows about the call it is serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub sid: String,
    pub owner: String,
    pub perm: Perm,
    pub method: String,
    pub path: String,
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    pub route: RouteIdentity,
    /// Work to run once the transaction commits.
    #[serde(skip)]
    pub on_commit: CommitHooks,
}

impl CallContext {
    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// See [`permission::verify_access`].
    pub fn verify_access(
        &self,
        required: Perm,
        expected_owner: Option<&str>,
    ) -> Result<(), CoreError> {
        permission::verify_access(self, required, expected_owner)
    }
}

impl Principal for CallContext {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn perm(&self) -> Perm {
        self.perm
    }
}
