//! Connection management.

use crate::error::ClientError;
use kontract_protocol::{
    random_nonce, CipherSuite, Decoder, Encoder, EventMessage, Frame, HandshakeInit,
    HandshakeResponse, MessageType, ProtocolError, RpcError, RpcResponse, SessionKeys,
    PROTOCOL_VERSION,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Client name sent in the handshake.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Authentication token (optional).
    pub auth_token: Option<String>,
    /// Shared secret for payload keys. Without it the connection stays
    /// in plaintext.
    pub master_secret: Option<Vec<u8>>,
    /// Suites offered when a secret is configured, in preference order.
    pub cipher_suites: Vec<CipherSuite>,
    /// Owner sent as `x-owner` metadata on every call.
    pub owner: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("client_name", &self.client_name)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("encrypted", &self.master_secret.is_some())
            .field("cipher_suites", &self.cipher_suites)
            .field("owner", &self.owner)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            auth_token: None,
            master_secret: None,
            cipher_suites: CipherSuite::ALL.to_vec(),
            owner: None,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_master_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.master_secret = Some(secret.into());
        self
    }

    pub fn with_cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Reply to a correlated request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(RpcResponse),
    Err(RpcError),
}

impl Reply {
    /// Converts the reply into a result.
    pub fn into_result(self) -> Result<RpcResponse, ClientError> {
        match self {
            Reply::Ok(response) => Ok(response),
            Reply::Err(error) => Err(error.into()),
        }
    }
}

/// Default capacity for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Writer {
    half: OwnedWriteHalf,
    encoder: Encoder,
}

/// A connection to a kontract server.
pub struct Connection {
    config: ConnectionConfig,
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    decoder: Mutex<Decoder>,
    /// Requests waiting for a reply, by correlation id.
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    /// Heartbeats waiting for the echo, oldest first.
    heartbeats: Mutex<VecDeque<oneshot::Sender<()>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    handshake: Mutex<Option<HandshakeResponse>>,
    events: broadcast::Sender<EventMessage>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(Decoder::new()),
            pending: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            handshake: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Receives every event pushed on this connection.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventMessage> {
        self.events.subscribe()
    }

    /// Returns the next correlation id.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Connects to the server and performs the handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(Writer {
            half: write_half,
            encoder: Encoder::new(),
        });
        *self.reader.lock().await = Some(read_half);
        *self.decoder.lock().await = Decoder::new();

        self.handshake().await?;
        tracing::debug!("Handshake complete");

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Sends HANDSHAKE_INIT and installs session keys if the server picked
    /// a suite. Reads the reply directly since the read loop isn't running
    /// yet.
    async fn handshake(&self) -> Result<(), ClientError> {
        let client_nonce = random_nonce();
        let mut init = HandshakeInit::new(&client_nonce);
        if let Some(ref name) = self.config.client_name {
            init = init.with_client_name(name.clone());
        }
        if let Some(ref token) = self.config.auth_token {
            init = init.with_token(token.clone());
        }
        if self.config.master_secret.is_some() {
            init = init.with_cipher_suites(self.config.cipher_suites.clone());
        }

        self.send(MessageType::HandshakeInit, &init).await?;
        let frame = self.read_single_frame().await?;

        let response: HandshakeResponse = match frame.msg_type {
            MessageType::HandshakeResponse => frame.parse()?,
            MessageType::RpcError => {
                let error: RpcError = frame.parse()?;
                return Err(error.into());
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected {} during handshake",
                    other
                )))
            }
        };

        if response.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::Handshake(format!(
                "server speaks protocol version {}",
                response.protocol_version
            )));
        }

        match (response.cipher_suite, &self.config.master_secret) {
            (Some(suite), Some(secret)) => {
                let server_nonce = response.nonce_bytes().map_err(ProtocolError::from)?;
                let keys = SessionKeys::derive(suite, secret, &client_nonce, &server_nonce);
                if let Some(writer) = self.writer.lock().await.as_mut() {
                    writer.encoder.install_keys(keys.clone());
                }
                self.decoder.lock().await.install_keys(keys);
                tracing::debug!("Payloads sealed with {}", suite.as_str());
            }
            (Some(suite), None) => {
                return Err(ClientError::Handshake(format!(
                    "server selected {} but no secret is configured",
                    suite.as_str()
                )));
            }
            (None, Some(_)) => {
                tracing::warn!("Server did not negotiate encryption; payloads are plaintext");
            }
            (None, None) => {}
        }

        *self.handshake.lock().await = Some(response);
        Ok(())
    }

    /// Reads one frame with timeout. Used during the handshake.
    async fn read_single_frame(&self) -> Result<Frame, ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        tokio::time::timeout(self.config.request_timeout, async {
            loop {
                if let Some(frame) = self.decoder.lock().await.decode_frame()? {
                    return Ok(frame);
                }

                let n = {
                    let mut reader_guard = self.reader.lock().await;
                    let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                    reader.read(&mut buf).await?
                };
                if n == 0 {
                    tracing::debug!("Connection closed (0 bytes)");
                    return Err(ClientError::ConnectionClosed);
                }
                self.decoder.lock().await.extend(&buf[..n]);
            }
        })
        .await
        .map_err(|_| {
            tracing::debug!("Read timeout");
            ClientError::Timeout
        })?
    }

    /// Returns the server's handshake response, once connected.
    pub async fn server_info(&self) -> Option<HandshakeResponse> {
        self.handshake.lock().await.clone()
    }

    /// Encodes and writes one frame.
    pub async fn send<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        message: &T,
    ) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        let bytes = writer.encoder.encode_json(msg_type, message)?;
        writer.half.write_all(&bytes).await?;
        Ok(())
    }

    async fn send_empty(&self, msg_type: MessageType) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        let bytes = writer.encoder.encode_empty(msg_type)?;
        writer.half.write_all(&bytes).await?;
        Ok(())
    }

    /// Sends a message correlated by `id` and waits for the reply.
    pub async fn request<T: serde::Serialize>(
        &self,
        id: String,
        msg_type: MessageType,
        message: &T,
    ) -> Result<Reply, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.send(msg_type, message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!("Request id={} sent ({}), waiting for reply", id, msg_type);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                tracing::debug!("Request id={} channel closed", id);
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a heartbeat and waits for the echo.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.heartbeats.lock().await.push_back(tx);
        self.send_empty(MessageType::Heartbeat).await?;

        tokio::time::timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Reads and dispatches replies and events (run this in a background
    /// task). Returns when the connection ends.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        tracing::debug!("read_loop started");
        let mut buf = vec![0u8; self.config.read_buffer_size];

        let result = loop {
            if let Err(e) = self.dispatch_buffered().await {
                break Err(e);
            }

            let read = {
                let mut reader_guard = self.reader.lock().await;
                match reader_guard.as_mut() {
                    Some(reader) => reader.read(&mut buf).await,
                    None => break Err(ClientError::NotConnected),
                }
            };

            match read {
                Ok(0) => {
                    tracing::debug!("read_loop: connection closed");
                    break Err(ClientError::ConnectionClosed);
                }
                Ok(n) => self.decoder.lock().await.extend(&buf[..n]),
                Err(e) => break Err(ClientError::Io(e)),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with ConnectionClosed
        self.pending.lock().await.clear();
        self.heartbeats.lock().await.clear();
        result
    }

    async fn dispatch_buffered(&self) -> Result<(), ClientError> {
        loop {
            let decoded = self.decoder.lock().await.decode_frame();
            let frame = match decoded {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(ProtocolError::Cipher(e)) => {
                    tracing::warn!("read_loop: undecryptable frame: {}", e);
                    self.fail_pending(RpcError::from_code(None, e.error_code(), e.to_string()))
                        .await;
                    return Err(ProtocolError::Cipher(e).into());
                }
                Err(e) => return Err(e.into()),
            };

            match frame.msg_type {
                MessageType::RpcResponse => {
                    let response: RpcResponse = frame.parse()?;
                    self.resolve(response.id.clone(), Reply::Ok(response)).await;
                }
                MessageType::RpcError => {
                    let error: RpcError = frame.parse()?;
                    match error.id.clone() {
                        Some(id) => self.resolve(id, Reply::Err(error)).await,
                        None => {
                            tracing::warn!(
                                "read_loop: connection-level error {}: {}",
                                error.error,
                                error.message
                            );
                            self.fail_pending(error).await;
                        }
                    }
                }
                MessageType::Event => {
                    let event: EventMessage = frame.parse()?;
                    tracing::debug!("read_loop: event on '{}'", event.resource);
                    // No receivers is fine
                    let _ = self.events.send(event);
                }
                MessageType::Heartbeat => {
                    if let Some(tx) = self.heartbeats.lock().await.pop_front() {
                        let _ = tx.send(());
                    }
                }
                MessageType::Close => return Err(ClientError::ConnectionClosed),
                other => tracing::warn!("read_loop: unexpected {} from server", other),
            }
        }
    }

    async fn resolve(&self, id: String, reply: Reply) {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!("read_loop: no pending request for id={}", id),
        }
    }

    /// Fails every pending request with `error`.
    async fn fail_pending(&self, error: RpcError) {
        let mut pending = self.pending.lock().await;
        for (id, tx) in pending.drain() {
            let mut error = error.clone();
            error.id = Some(id);
            let _ = tx.send(Reply::Err(error));
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends CLOSE and shuts the write side down.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        if self.connected.swap(false, Ordering::SeqCst) {
            // Best effort; the server may already be gone
            let _ = self.send_empty(MessageType::Close).await;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.half.shutdown().await;
        }

        let mut pending = self.pending.lock().await;
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }
}
