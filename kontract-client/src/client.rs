//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use kontract_protocol::{EventMessage, HandshakeResponse, MessageType, RpcCall, Subscribe};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

const OWNER_KEY: &str = "x-owner";
const SESSION_KEY: &str = "x-session-id";

/// Outcome of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub status: u16,
    pub result: Value,
    /// Session the call committed under; pass it back to resume.
    pub session_id: Option<String>,
}

/// High-level client for kontract.
pub struct Client {
    conn: Arc<Connection>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            read_task: Mutex::new(None),
        }
    }

    /// Connects, performs the handshake and starts the background reader.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let conn = self.conn.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("Read loop ended: {}", e);
            }
        });
        if let Some(previous) = self.read_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await?;
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Returns the server's handshake response.
    pub async fn server_info(&self) -> Option<HandshakeResponse> {
        self.conn.server_info().await
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Calls a route and returns its result.
    ///
    /// `args` is the positional argument list; a non-array value is passed
    /// as the single argument.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, ClientError> {
        Ok(self
            .call_with_metadata(method, args, HashMap::new())
            .await?
            .result)
    }

    /// Calls a route inside an existing session.
    pub async fn call_in_session(
        &self,
        method: &str,
        args: Value,
        session_id: &str,
    ) -> Result<CallResult, ClientError> {
        let mut metadata = HashMap::new();
        metadata.insert(SESSION_KEY.to_string(), session_id.to_string());
        self.call_with_metadata(method, args, metadata).await
    }

    /// Calls a route with explicit metadata. The configured owner is added
    /// unless `metadata` already names one.
    pub async fn call_with_metadata(
        &self,
        method: &str,
        args: Value,
        mut metadata: HashMap<String, String>,
    ) -> Result<CallResult, ClientError> {
        if let Some(ref owner) = self.conn.config().owner {
            metadata
                .entry(OWNER_KEY.to_string())
                .or_insert_with(|| owner.clone());
        }

        let id = self.conn.next_id();
        let mut call = RpcCall::new(id.clone(), method, args);
        call.metadata = metadata;

        let response = self
            .conn
            .request(id, MessageType::RpcCall, &call)
            .await?
            .into_result()?;

        Ok(CallResult {
            status: response.status,
            result: response.result,
            session_id: response.session_id,
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Receives every event pushed on this connection. Call this before
    /// [`Client::subscribe`] to avoid missing the first events.
    pub fn events(&self) -> broadcast::Receiver<EventMessage> {
        self.conn.subscribe_events()
    }

    /// Subscribes to a resource. Returns the subscription id.
    pub async fn subscribe(&self, resource: &str) -> Result<String, ClientError> {
        let id = format!("sub-{}", Uuid::new_v4());
        let request = Subscribe::new(id.clone(), resource);
        self.conn
            .request(id.clone(), MessageType::Subscribe, &request)
            .await?
            .into_result()?;
        Ok(id)
    }

    /// Cancels a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, id: &str, resource: &str) -> Result<bool, ClientError> {
        let request = Subscribe::cancel(id, resource);
        let response = self
            .conn
            .request(id.to_string(), MessageType::Subscribe, &request)
            .await?
            .into_result()?;
        Ok(response.result["unsubscribed"].as_bool().unwrap_or(false))
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Sends a heartbeat and waits for the echo.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.conn.heartbeat().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut task) = self.read_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
