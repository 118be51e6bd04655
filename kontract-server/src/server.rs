//! TCP server implementation.

use crate::auth::TokenValidator;
use crate::error::ServerError;
use crate::gateway::{GatewayResponse, RpcGateway};
use crate::metrics::Metrics;
use crate::session::{ClientSession, SessionState};
use kontract_core::EventBus;
use kontract_protocol::{
    random_nonce, CipherSuite, Decoder, Encoder, ErrorCode, EventMessage, Frame, HandshakeInit,
    HandshakeResponse, MessageType, ProtocolError, RpcCall, RpcError, RpcResponse, SessionKeys,
    Subscribe, PROTOCOL_VERSION,
};
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Pending events buffered per connection before new ones are dropped.
    pub event_buffer: usize,
    /// Shared secret for payload keys. `None` keeps every connection in
    /// plaintext.
    pub master_secret: Option<Arc<Vec<u8>>>,
    /// Suites accepted from clients.
    pub cipher_suites: Vec<CipherSuite>,
    /// Reject clients that do not negotiate a suite.
    pub require_encryption: bool,
    /// Name reported in the handshake response.
    pub server_name: String,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("event_buffer", &self.event_buffer)
            .field("encryption_enabled", &self.master_secret.is_some())
            .field("cipher_suites", &self.cipher_suites)
            .field("require_encryption", &self.require_encryption)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, kontract_protocol::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            event_buffer: 256,
            master_secret: None,
            cipher_suites: CipherSuite::ALL.to_vec(),
            require_encryption: false,
            server_name: "kontract".to_string(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Enables payload encryption with `secret`.
    pub fn with_master_secret(mut self, secret: Vec<u8>) -> Self {
        self.master_secret = Some(Arc::new(secret));
        self
    }

    pub fn with_cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    pub fn with_require_encryption(mut self, require: bool) -> Self {
        self.require_encryption = require;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn encryption_enabled(&self) -> bool {
        self.master_secret.is_some()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs, shared across connections.
struct Shared {
    config: ServerConfig,
    gateway: Arc<RpcGateway>,
    bus: EventBus,
    auth: TokenValidator,
    stats: Arc<ServerStats>,
}

/// TCP server for kontract.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// Event forwarded from an event bus handler to the connection task.
struct ForwardedEvent {
    subscription_id: String,
    message: EventMessage,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        gateway: Arc<RpcGateway>,
        bus: EventBus,
        auth: TokenValidator,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                gateway,
                bus,
                auth,
                stats: Arc::new(ServerStats::default()),
            }),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections accepted on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        let config = &self.shared.config;
        let stats = &self.shared.stats;

        tracing::info!(
            "Server listening on {} ({})",
            listener.local_addr()?,
            if config.encryption_enabled() {
                "encrypted"
            } else {
                "plain"
            }
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if stats.connections_active.load(Ordering::Relaxed)
                                >= config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let shared = self.shared.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result =
                                    Self::handle_connection(stream, addr, &shared, &mut conn_shutdown)
                                        .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = shared.config.metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: &Shared,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);
        let _ = stream.set_nodelay(true);

        let (event_tx, event_rx) = mpsc::channel(shared.config.event_buffer.max(1));
        let conn = Connection {
            stream,
            addr,
            session: ClientSession::new(addr),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            calls: JoinSet::new(),
            event_tx,
            shared,
        };
        conn.run(event_rx, shutdown).await
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}

/// Reply produced by a spawned call task.
enum CallReply {
    Ok(RpcResponse),
    Err(RpcError),
}

impl CallReply {
    fn from_gateway(id: String, response: GatewayResponse) -> Self {
        let status = response.status;
        match response.body {
            kontract_protocol::RpcEnvelope::Success { result } => {
                let mut reply = RpcResponse::ok(id, result);
                reply.status = status;
                reply.session_id = response.session_id;
                CallReply::Ok(reply)
            }
            kontract_protocol::RpcEnvelope::Failure { error, message } => {
                CallReply::Err(RpcError::new(Some(id), status, error, message))
            }
        }
    }
}

/// Whether the connection keeps reading after a frame.
enum Flow {
    Continue,
    Close,
}

struct Connection<'a> {
    stream: TcpStream,
    addr: SocketAddr,
    session: ClientSession,
    encoder: Encoder,
    decoder: Decoder,
    /// In-flight calls. Aborted when the connection ends, so an abandoned
    /// call never commits.
    calls: JoinSet<CallReply>,
    event_tx: mpsc::Sender<ForwardedEvent>,
    shared: &'a Shared,
}

impl Connection<'_> {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<ForwardedEvent>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let idle_timeout = self.shared.config.idle_timeout;
        let mut buf = [0u8; 8192];

        let result = loop {
            tokio::select! {
                biased;

                Some(forwarded) = event_rx.recv() => {
                    if let Err(e) = self.write_event(forwarded).await {
                        break Err(e);
                    }
                }

                Some(joined) = self.calls.join_next(), if !self.calls.is_empty() => {
                    let written = match joined {
                        Ok(CallReply::Ok(response)) => {
                            self.write(MessageType::RpcResponse, &response).await
                        }
                        Ok(CallReply::Err(error)) => {
                            self.write(MessageType::RpcError, &error).await
                        }
                        Err(e) => {
                            tracing::error!("[{}] Call task failed: {}", self.addr, e);
                            Ok(())
                        }
                    };
                    if let Err(e) = written {
                        break Err(e);
                    }
                }

                result = self.stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", self.addr);
                            break Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", self.addr, n);
                            self.decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", self.addr, e);
                            break Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(idle_timeout) => {
                    if self.session.idle_duration() > idle_timeout {
                        tracing::debug!("[{}] Idle timeout", self.addr);
                        break Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", self.addr);
                    break Err(ServerError::ShuttingDown);
                }
            }

            match self.process_buffered().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.session.set_state(SessionState::Closing);
        self.calls.abort_all();
        let removed = self.session.clear_subscriptions();
        if let Some(ref metrics) = self.shared.config.metrics {
            metrics.subscriptions_active.sub(removed as f64);
        }
        tracing::debug!(
            "[{}] Session {} closed (client={}, protocol=v{}, requests={}, subscriptions={}, age={:?})",
            self.addr,
            self.session.id,
            self.session.client_name().unwrap_or("-"),
            self.session.protocol_version(),
            self.session.request_count(),
            removed,
            self.session.age()
        );
        result
    }

    /// Handles every complete frame in the decoder buffer.
    async fn process_buffered(&mut self) -> Result<Flow, ServerError> {
        loop {
            let frame = match self.decoder.decode_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(Flow::Continue),
                Err(ProtocolError::Cipher(e)) => {
                    tracing::warn!("[{}] Rejecting undecryptable frame: {}", self.addr, e);
                    if let Some(ref metrics) = self.shared.config.metrics {
                        metrics.decryption_failures_total.inc();
                    }
                    let error = RpcError::from_code(None, e.error_code(), e.to_string());
                    self.write(MessageType::RpcError, &error).await?;
                    return Ok(Flow::Close);
                }
                Err(e) => {
                    tracing::warn!("[{}] Protocol error: {}", self.addr, e);
                    let error = RpcError::from_code(None, ErrorCode::BadRequest, e.to_string());
                    self.write(MessageType::RpcError, &error).await?;
                    return Err(e.into());
                }
            };

            self.session.record_request();
            self.shared
                .stats
                .requests_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{}] Frame: {}", self.addr, frame.msg_type);

            if let Flow::Close = self.handle_frame(frame).await? {
                return Ok(Flow::Close);
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, ServerError> {
        match frame.msg_type {
            MessageType::HandshakeInit => self.handshake(&frame).await,
            MessageType::Heartbeat => {
                let bytes = self.encoder.encode_empty(MessageType::Heartbeat)?;
                self.stream.write_all(&bytes).await?;
                Ok(Flow::Continue)
            }
            MessageType::Close => {
                tracing::debug!("[{}] Session closing", self.addr);
                Ok(Flow::Close)
            }
            _ if !self.session.is_ready() => {
                let err = ServerError::HandshakeRequired(frame.msg_type.to_string());
                self.reject(None, &err).await?;
                Ok(Flow::Continue)
            }
            MessageType::RpcCall => {
                let call: RpcCall = match frame.parse() {
                    Ok(call) => call,
                    Err(e) => {
                        self.reject(None, &ServerError::Protocol(e)).await?;
                        return Ok(Flow::Continue);
                    }
                };
                self.spawn_call(call);
                Ok(Flow::Continue)
            }
            MessageType::Subscribe => {
                let request: Subscribe = match frame.parse() {
                    Ok(request) => request,
                    Err(e) => {
                        self.reject(None, &ServerError::Protocol(e)).await?;
                        return Ok(Flow::Continue);
                    }
                };
                self.subscribe(request).await?;
                Ok(Flow::Continue)
            }
            other => {
                let err = ServerError::InvalidRequest(format!("unexpected {} from client", other));
                self.reject(None, &err).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handshake(&mut self, frame: &Frame) -> Result<Flow, ServerError> {
        if self.session.state() != SessionState::Connected {
            let err = ServerError::InvalidRequest("handshake already completed".to_string());
            self.reject(None, &err).await?;
            return Ok(Flow::Continue);
        }

        let init: HandshakeInit = match frame.parse() {
            Ok(init) => init,
            Err(e) => {
                self.reject(None, &ServerError::Protocol(e)).await?;
                return Ok(Flow::Close);
            }
        };

        match self.negotiate(&init) {
            Ok((response, keys)) => {
                self.write(MessageType::HandshakeResponse, &response).await?;
                if let Some(keys) = keys {
                    self.encoder.install_keys(keys.clone());
                    self.decoder.install_keys(keys);
                }
                self.session.complete_handshake(
                    init.protocol_version,
                    init.client_name.clone(),
                    response.cipher_suite,
                );
                tracing::info!(
                    "[{}] Handshake complete (client={}, cipher={})",
                    self.addr,
                    init.client_name.as_deref().unwrap_or("-"),
                    response
                        .cipher_suite
                        .map(|s| s.as_str())
                        .unwrap_or("none")
                );
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::warn!("[{}] Handshake rejected: {}", self.addr, e);
                self.reject(None, &e).await?;
                Ok(Flow::Close)
            }
        }
    }

    fn negotiate(
        &self,
        init: &HandshakeInit,
    ) -> Result<(HandshakeResponse, Option<SessionKeys>), ServerError> {
        let config = &self.shared.config;

        if init.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedVersion(init.protocol_version));
        }
        self.shared.auth.authenticate(init.token.as_deref())?;

        let client_nonce = init
            .nonce_bytes()
            .map_err(|e| ServerError::Protocol(e.into()))?;
        let server_nonce = random_nonce();

        let keys = match (&config.master_secret, init.cipher_suites.is_empty()) {
            (Some(secret), false) => {
                let suite = CipherSuite::negotiate(&init.cipher_suites, &config.cipher_suites)
                    .map_err(|_| ServerError::NoCommonSuite)?;
                Some(SessionKeys::derive(
                    suite,
                    secret,
                    &client_nonce,
                    &server_nonce,
                ))
            }
            _ if config.require_encryption => return Err(ServerError::NoCommonSuite),
            _ => None,
        };

        let response = HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            session_id: self.session.id.clone(),
            cipher_suite: keys.as_ref().map(SessionKeys::suite),
            server_nonce: hex::encode(server_nonce),
            server_name: config.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        Ok((response, keys))
    }

    fn spawn_call(&mut self, call: RpcCall) {
        tracing::info!("[{}] Call: {} (id={})", self.addr, call.method, call.id);
        let gateway = self.shared.gateway.clone();
        self.calls.spawn(async move {
            let response = gateway.call(&call.method, &call.metadata, call.args).await;
            CallReply::from_gateway(call.id, response)
        });
    }

    async fn subscribe(&mut self, request: Subscribe) -> Result<(), ServerError> {
        let metrics = self.shared.config.metrics.clone();

        if request.unsubscribe {
            let removed = self.session.remove_subscription(&request.id);
            if removed {
                if let Some(ref m) = metrics {
                    m.subscriptions_active.dec();
                }
            }
            let response = RpcResponse::ok(request.id, json!({"unsubscribed": removed}));
            return self.write(MessageType::RpcResponse, &response).await;
        }

        let tx = self.event_tx.clone();
        let addr = self.addr;
        let subscription_id = request.id.clone();
        let resource = request.resource.clone();
        let dropped = metrics.clone();
        let subscription = self.shared.bus.subscribe(request.resource.clone(), move |event| {
            let forwarded = ForwardedEvent {
                subscription_id: subscription_id.clone(),
                message: EventMessage {
                    resource: resource.clone(),
                    event: event.clone(),
                },
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(forwarded) {
                tracing::warn!(
                    "[{}] Subscriber {} lagging, dropped event",
                    addr,
                    subscription_id
                );
                if let Some(ref m) = dropped {
                    m.events_dropped_total.inc();
                }
            }
        });

        tracing::info!(
            "[{}] Subscribed {} to '{}'",
            self.addr,
            request.id,
            request.resource
        );
        self.session.add_subscription(request.id.clone(), subscription);
        if let Some(ref m) = metrics {
            m.subscriptions_active.inc();
        }

        let response = RpcResponse::ok(request.id, json!({"subscribed": request.resource}));
        self.write(MessageType::RpcResponse, &response).await
    }

    async fn write_event(&mut self, forwarded: ForwardedEvent) -> Result<(), ServerError> {
        tracing::debug!(
            "[{}] Forwarding {} event to {}",
            self.addr,
            forwarded.message.resource,
            forwarded.subscription_id
        );
        self.write(MessageType::Event, &forwarded.message).await?;
        if let Some(ref metrics) = self.shared.config.metrics {
            metrics.events_forwarded_total.inc();
        }
        Ok(())
    }

    async fn reject(&mut self, id: Option<String>, err: &ServerError) -> Result<(), ServerError> {
        let error = RpcError::from_code(id, err.error_code(), err.to_string());
        self.write(MessageType::RpcError, &error).await
    }

    async fn write<T: serde::Serialize>(
        &mut self,
        msg_type: MessageType,
        value: &T,
    ) -> Result<(), ServerError> {
        let bytes = self.encoder.encode_json(msg_type, value)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }
}
