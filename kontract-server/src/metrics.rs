//! Prometheus metrics for the kontract server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Call duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for the kontract server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Total RPC calls by route.
    pub rpc_calls_total: CounterVec,
    /// Total RPC errors by error code.
    pub rpc_errors_total: CounterVec,
    /// RPC duration histogram by route.
    pub rpc_duration: HistogramVec,
    /// Transactions by outcome (committed, abandoned).
    pub transactions_total: CounterVec,
    /// Active event subscriptions.
    pub subscriptions_active: Gauge,
    /// Events written to subscribers.
    pub events_forwarded_total: Counter,
    /// Events dropped because a subscriber lagged.
    pub events_dropped_total: Counter,
    /// Frames that failed authentication.
    pub decryption_failures_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "kontract_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "kontract_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Calls
        let rpc_calls_total = CounterVec::new(
            Opts::new("kontract_rpc_calls_total", "Total RPC calls by route"),
            &["route"],
        )?;
        registry.register(Box::new(rpc_calls_total.clone()))?;

        let rpc_errors_total = CounterVec::new(
            Opts::new("kontract_rpc_errors_total", "Total RPC errors by error code"),
            &["code"],
        )?;
        registry.register(Box::new(rpc_errors_total.clone()))?;

        let rpc_duration = HistogramVec::new(
            HistogramOpts::new(
                "kontract_rpc_duration_seconds",
                "RPC duration in seconds by route",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["route"],
        )?;
        registry.register(Box::new(rpc_duration.clone()))?;

        let transactions_total = CounterVec::new(
            Opts::new(
                "kontract_transactions_total",
                "Session transactions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        // Events
        let subscriptions_active = Gauge::with_opts(Opts::new(
            "kontract_subscriptions_active",
            "Active event subscriptions",
        ))?;
        registry.register(Box::new(subscriptions_active.clone()))?;

        let events_forwarded_total = Counter::with_opts(Opts::new(
            "kontract_events_forwarded_total",
            "Total change events forwarded to subscribers",
        ))?;
        registry.register(Box::new(events_forwarded_total.clone()))?;

        let events_dropped_total = Counter::with_opts(Opts::new(
            "kontract_events_dropped_total",
            "Change events dropped for lagging subscribers",
        ))?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        let decryption_failures_total = Counter::with_opts(Opts::new(
            "kontract_decryption_failures_total",
            "Frames rejected because they failed to decrypt",
        ))?;
        registry.register(Box::new(decryption_failures_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            rpc_calls_total,
            rpc_errors_total,
            rpc_duration,
            transactions_total,
            subscriptions_active,
            events_forwarded_total,
            events_dropped_total,
            decryption_failures_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Serves `/metrics` and `/health` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route_request(req.uri().path(), &metrics))
}

fn route_request(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/health" | "/healthz" => {
            text_response(StatusCode::OK, "text/plain", b"OK".to_vec())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", b"Not Found".to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.rpc_calls_total.with_label_values(&["add"]).inc();
        metrics.rpc_errors_total.with_label_values(&["NOT_FOUND"]).inc();
        metrics.rpc_duration.with_label_values(&["add"]).observe(0.001);
        metrics
            .transactions_total
            .with_label_values(&["committed"])
            .inc();

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("kontract_connections_total"));
        assert!(encoded.contains("kontract_connections_active"));
        assert!(encoded.contains("kontract_rpc_calls_total"));
        assert!(encoded.contains("kontract_rpc_errors_total"));
        assert!(encoded.contains("kontract_rpc_duration_seconds"));
        assert!(encoded.contains("kontract_transactions_total"));
    }

    #[test]
    fn test_event_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.subscriptions_active.set(3.0);
        metrics.events_forwarded_total.inc_by(5.0);
        metrics.events_dropped_total.inc();

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("kontract_subscriptions_active 3"));
        assert!(encoded.contains("kontract_events_forwarded_total 5"));
        assert!(encoded.contains("kontract_events_dropped_total 1"));
    }

    #[test]
    fn test_route_request() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(route_request("/metrics", &metrics).status(), StatusCode::OK);
        assert_eq!(route_request("/healthz", &metrics).status(), StatusCode::OK);
        assert_eq!(
            route_request("/nope", &metrics).status(),
            StatusCode::NOT_FOUND
        );
    }
}
