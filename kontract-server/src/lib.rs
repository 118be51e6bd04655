//! # kontract-server
//!
//! TCP server for kontract.
//!
//! This crate provides:
//! - The RPC gateway: route lookup, session transactions, error mapping
//! - TCP connection handling with async I/O and encrypted framing
//! - Event push to subscribed connections
//! - Built-in `state.*` routes over shared storage
//! - Token-based authentication
//! - Prometheus metrics

pub mod auth;
pub mod builtin;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod server;
pub mod session;

pub use auth::TokenValidator;
pub use builtin::{register_state_routes, STATE_RESOURCE};
pub use config::{
    AuthConfig, Config, ConfigError, CryptoConfig, GatewayConfig, MetricsConfig, NetworkConfig,
    StorageConfig,
};
pub use error::ServerError;
pub use gateway::{GatewayReply, GatewayRequest, GatewayResponse, RpcGateway};
pub use metrics::Metrics;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{ClientSession, SessionState};
