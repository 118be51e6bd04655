//! kontract - Remote Function Gateway
//!
//! Serves named routes over a framed, optionally encrypted TCP protocol,
//! with per-call session transactions and two-tier shared state.

use kontract_core::{EventBus, Perm, RouteTable, TransactionManager};
use kontract_server::metrics::{run_metrics_server, Metrics};
use kontract_server::{
    register_state_routes, Config, RpcGateway, Server, ServerConfig, TokenValidator,
};
use kontract_storage::{MemoryRemote, SharedStorage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if KONTRACT_CONFIG is set, then env overrides)
    let config_path = std::env::var("KONTRACT_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    // Load auth secrets from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting kontract server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);

    if config.auth.required {
        tracing::info!(
            "  Authentication: enabled ({} token(s))",
            config.auth.token_hashes.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }

    let master_secret = config.crypto.master_secret_bytes()?;
    match master_secret {
        Some(_) => tracing::info!(
            "  Encryption: enabled (suites: {}{})",
            config
                .crypto
                .cipher_suites
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            if config.crypto.require_encryption {
                ", required"
            } else {
                ""
            }
        ),
        None => tracing::info!("  Encryption: disabled"),
    }

    // Shared state
    tracing::warn!("Using in-memory remote store; shared state is lost on restart");
    let storage = Arc::new(SharedStorage::from_remote(
        Arc::new(MemoryRemote::new()),
        &config.storage.shared,
    ));
    tracing::info!(
        "  Hot prefixes: {}",
        config.storage.shared.hot_prefixes.join(", ")
    );

    let transactions = Arc::new(
        TransactionManager::new(storage.clone()).with_session_ttl(config.storage.session_ttl()),
    );
    let bus = EventBus::new();

    let mut routes = RouteTable::new();
    register_state_routes(&mut routes, storage, bus.clone())?;
    tracing::info!("  Routes: {}", routes.len());

    // Metrics
    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let default_perm = config.gateway.default_perm();
    if default_perm == Perm::ALL {
        tracing::warn!("Routes without an explicit perm grant read, write and execute");
    }

    let mut gateway = RpcGateway::new(Arc::new(routes), transactions)
        .with_default_perm(default_perm)
        .with_call_timeout(config.gateway.call_timeout());
    if let Some(ref m) = metrics {
        gateway = gateway.with_metrics(m.clone());
    }

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_idle_timeout(config.network.idle_timeout())
        .with_max_connections(config.network.max_connections)
        .with_cipher_suites(config.crypto.cipher_suites.clone())
        .with_require_encryption(config.crypto.require_encryption);
    if let Some(secret) = master_secret {
        server_config = server_config.with_master_secret(secret);
    }
    if let Some(ref m) = metrics {
        server_config = server_config.with_metrics(m.clone());
    }

    let server = Arc::new(Server::new(
        server_config,
        Arc::new(gateway),
        bus,
        TokenValidator::from_config(&config.auth),
    ));

    // Spawn metrics server
    let (metrics_shutdown_tx, _) = broadcast::channel(1);
    let metrics_handle = metrics.map(|m| {
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, m, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_metrics = metrics_shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_metrics.send(());
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = metrics_shutdown_tx.send(());
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
