//! Per-connection state.

use kontract_core::Subscription;
use kontract_protocol::CipherSuite;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for HANDSHAKE_INIT.
    Connected,
    /// Handshake complete, accepting calls.
    Ready,
    /// CLOSE received or fatal error; no further frames are processed.
    Closing,
}

/// State of one client connection.
///
/// Not to be confused with the session id of a call transaction: one
/// connection may carry calls for many transaction sessions.
pub struct ClientSession {
    /// Unique connection id, sent back in the handshake response.
    pub id: String,

    pub remote_addr: SocketAddr,

    state: SessionState,

    protocol_version: u16,

    client_name: Option<String>,

    /// `None` for plaintext connections.
    cipher_suite: Option<CipherSuite>,

    request_count: AtomicU64,

    created_at: Instant,

    last_activity: Mutex<Instant>,

    /// Client-chosen subscription id -> event bus registration.
    subscriptions: HashMap<String, Subscription>,
}

impl ClientSession {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            protocol_version: 0,
            client_name: None,
            cipher_suite: None,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            subscriptions: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    /// Completes the handshake and moves to [`SessionState::Ready`].
    pub fn complete_handshake(
        &mut self,
        protocol_version: u16,
        client_name: Option<String>,
        cipher_suite: Option<CipherSuite>,
    ) {
        self.protocol_version = protocol_version;
        self.client_name = client_name;
        self.cipher_suite = cipher_suite;
        self.state = SessionState::Ready;
    }

    /// Records a frame received from the client.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Tracks a subscription. An existing one under the same id is
    /// unsubscribed and replaced.
    pub fn add_subscription(&mut self, id: String, subscription: Subscription) {
        if let Some(previous) = self.subscriptions.insert(id, subscription) {
            previous.unsubscribe();
        }
    }

    /// Unsubscribes and forgets `id`. Returns whether it existed.
    pub fn remove_subscription(&mut self, id: &str) -> bool {
        match self.subscriptions.remove(id) {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Unsubscribes everything. Returns how many were removed.
    pub fn clear_subscriptions(&mut self) -> usize {
        let count = self.subscriptions.len();
        for (_, subscription) in self.subscriptions.drain() {
            subscription.unsubscribe();
        }
        count
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.clear_subscriptions();
    }
}
