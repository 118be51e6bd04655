//! RPC gateway.
//!
//! Resolves a route by name, wraps the handler invocation in a session
//! transaction and turns the outcome into a status plus an
//! [`RpcEnvelope`]. The gateway is transport-agnostic: the TCP server feeds
//! it decoded `RPC_CALL` frames, and [`RpcGateway::handle_request`] accepts
//! already-parsed HTTP-shaped requests from whatever adapter sits in front.

use crate::metrics::Metrics;
use kontract_core::{
    CallContext, CommitHooks, CoreError, Perm, RouteIdentity, RouteTable, TransactionManager,
};
use kontract_protocol::{ErrorCode, RpcEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Header carrying the caller's owner identity.
pub const OWNER_HEADER: &str = "x-owner";

/// Header carrying a session id to resume.
pub const SESSION_HEADER: &str = "x-session-id";

/// Message sent for every unclassified failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: RpcEnvelope,
    /// Session id of the committed transaction; absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl GatewayResponse {
    fn success(result: Value, session_id: String) -> Self {
        Self {
            status: 200,
            body: RpcEnvelope::success(result),
            session_id: Some(session_id),
        }
    }

    fn failure(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: RpcEnvelope::failure(code, message),
            session_id: None,
        }
    }

    fn from_error(err: &CoreError) -> Self {
        if err.is_classified() {
            Self::failure(err.status(), err.error_code(), err.to_string())
        } else {
            Self::internal()
        }
    }

    fn internal() -> Self {
        Self::failure(
            ErrorCode::InternalError.status(),
            ErrorCode::InternalError.as_str(),
            INTERNAL_ERROR_MESSAGE,
        )
    }

    pub fn is_success(&self) -> bool {
        self.body.is_success()
    }
}

/// An HTTP-shaped request, already parsed by the transport adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Response to a [`GatewayRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayReply {
    pub status: u16,
    pub body: Value,
}

impl From<GatewayResponse> for GatewayReply {
    fn from(response: GatewayResponse) -> Self {
        Self {
            status: response.status,
            body: serde_json::to_value(&response.body).unwrap_or(Value::Null),
        }
    }
}

/// Dispatches calls to registered routes.
pub struct RpcGateway {
    routes: Arc<RouteTable>,
    transactions: Arc<TransactionManager>,
    default_perm: Perm,
    call_timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

impl RpcGateway {
    pub fn new(routes: Arc<RouteTable>, transactions: Arc<TransactionManager>) -> Self {
        Self {
            routes,
            transactions,
            default_perm: Perm::ALL,
            call_timeout: None,
            metrics: None,
        }
    }

    /// Sets the mask granted to routes that declare none.
    pub fn with_default_perm(mut self, perm: Perm) -> Self {
        self.default_perm = perm;
        self
    }

    /// Bounds each handler invocation.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Calls `route_name` with `body` as its arguments.
    pub async fn call(
        &self,
        route_name: &str,
        headers: &HashMap<String, String>,
        body: Value,
    ) -> GatewayResponse {
        let path = format!("/rpc/{}", route_name);
        self.invoke("POST", &path, route_name, headers, body).await
    }

    /// Dispatches an HTTP-shaped request.
    ///
    /// `POST /rpc/<name>` calls a route, `/health` and `/healthz` report the
    /// route count, anything else is `404`.
    pub async fn handle_request(&self, req: GatewayRequest) -> GatewayReply {
        if req.path == "/health" || req.path == "/healthz" {
            return GatewayReply {
                status: 200,
                body: json!({"status": "ok", "routes": self.routes.len()}),
            };
        }

        if req.method.eq_ignore_ascii_case("POST") {
            if let Some(name) = rpc_route_name(&req.path) {
                let response = self
                    .invoke(&req.method, &req.path, name, &req.headers, req.body)
                    .await;
                return response.into();
            }
        }

        GatewayResponse::failure(404, ErrorCode::NotFound.as_str(), "Not found").into()
    }

    async fn invoke(
        &self,
        method: &str,
        path: &str,
        route_name: &str,
        headers: &HashMap<String, String>,
        body: Value,
    ) -> GatewayResponse {
        let started = Instant::now();
        let response = self.dispatch(method, path, route_name, headers, body).await;

        if let Some(ref metrics) = self.metrics {
            let label = if self.routes.get(route_name).is_some() {
                route_name
            } else {
                "unknown"
            };
            metrics.rpc_calls_total.with_label_values(&[label]).inc();
            metrics
                .rpc_duration
                .with_label_values(&[label])
                .observe(started.elapsed().as_secs_f64());
            if let Some(code) = response.body.error() {
                metrics.rpc_errors_total.with_label_values(&[code]).inc();
            }
        }

        response
    }

    async fn dispatch(
        &self,
        method: &str,
        path: &str,
        route_name: &str,
        headers: &HashMap<String, String>,
        body: Value,
    ) -> GatewayResponse {
        let route = match self.routes.get(route_name) {
            Some(route) => route,
            None => {
                return GatewayResponse::from_error(&CoreError::not_found(format!(
                    "Route '{}' not found",
                    route_name
                )));
            }
        };

        let headers: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        let perm = route.meta().granted_perm(self.default_perm);

        let mut tx = match self
            .transactions
            .begin(
                headers.get(OWNER_HEADER).map(String::as_str),
                headers.get(SESSION_HEADER).map(String::as_str),
                perm,
            )
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!("Cannot begin transaction for {}: {}", route_name, e);
                return self.failed(&e);
            }
        };

        let on_commit = CommitHooks::new();
        let ctx = CallContext {
            sid: tx.sid().to_string(),
            owner: tx.owner().to_string(),
            perm: tx.perm(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            route: RouteIdentity {
                name: route.name().to_string(),
                egroup: route.meta().egroup.clone(),
            },
            on_commit: on_commit.clone(),
        };

        let handler = route.handler().clone();
        let args = normalize_args(body);
        let mut task = tokio::spawn(async move { handler.call(ctx, args).await });

        let joined = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    self.abandon(&mut tx);
                    tracing::warn!("Call {} timed out after {:?}", route_name, limit);
                    return GatewayResponse::from_error(&CoreError::Timeout(limit));
                }
            },
            None => task.await,
        };

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(CoreError::Internal(format!("handler task failed: {}", e))),
        };

        match outcome {
            Ok(result) => match self.transactions.commit(&mut tx).await {
                Ok(()) => {
                    self.record_outcome("committed");
                    on_commit.run();
                    GatewayResponse::success(result, tx.sid().to_string())
                }
                Err(e) => {
                    tracing::error!("Commit of {} failed: {}", tx.sid(), e);
                    self.record_outcome("failed");
                    GatewayResponse::internal()
                }
            },
            Err(e) => {
                self.abandon(&mut tx);
                self.failed(&e)
            }
        }
    }

    fn failed(&self, err: &CoreError) -> GatewayResponse {
        if !err.is_classified() {
            tracing::error!("Unclassified call failure: {}", err);
        }
        GatewayResponse::from_error(err)
    }

    fn abandon(&self, tx: &mut kontract_core::Transaction) {
        self.transactions.abandon(tx);
        self.record_outcome("abandoned");
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.transactions_total.with_label_values(&[outcome]).inc();
        }
    }
}

/// A list is passed through; any other value becomes a one-element list.
pub fn normalize_args(body: Value) -> Vec<Value> {
    match body {
        Value::Array(args) => args,
        other => vec![other],
    }
}

/// Extracts `<name>` from `/rpc/<name>`.
///
/// Names are ASCII alphanumerics, `_` and `.`.
fn rpc_route_name(path: &str) -> Option<&str> {
    let name = path.strip_prefix("/rpc/")?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    valid.then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_state_routes;
    use kontract_core::{EventBus, Route, RouteMeta};
    use kontract_storage::{MemoryRemote, SharedStorage, StorageConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn routes() -> RouteTable {
        let mut table = RouteTable::new();
        table
            .register(Route::new("add", |_ctx: CallContext, args: Vec<Value>| async move {
                let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                Ok::<_, CoreError>(json!(a + b))
            }))
            .unwrap();
        table
            .register(Route::new("echo", |_ctx: CallContext, args: Vec<Value>| async move {
                Ok::<_, CoreError>(args.into_iter().next().unwrap_or(Value::Null))
            }))
            .unwrap();
        table
            .register(Route::new("fail", |_ctx: CallContext, _args: Vec<Value>| async move {
                Err::<Value, _>(CoreError::custom(403, "FORBIDDEN", "Access denied"))
            }))
            .unwrap();
        table
            .register(Route::new("crash", |_ctx: CallContext, _args: Vec<Value>| async move {
                Err::<Value, _>(CoreError::Internal("db password is hunter2".into()))
            }))
            .unwrap();
        table
            .register(Route::new("whoami", |ctx: CallContext, _args: Vec<Value>| async move {
                Ok::<_, CoreError>(json!({
                    "owner": ctx.owner,
                    "perm": ctx.perm.bits(),
                    "egroup": ctx.route.egroup,
                }))
            }))
            .unwrap();
        table
            .register(
                Route::new("readonly", |ctx: CallContext, _args: Vec<Value>| async move {
                    ctx.verify_access(Perm::WRITE, None)?;
                    Ok::<_, CoreError>(Value::Null)
                })
                .with_meta(RouteMeta::new().with_perm(Perm::READ).with_egroup("reports")),
            )
            .unwrap();
        table
            .register(Route::new("slow", |_ctx: CallContext, _args: Vec<Value>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CoreError>(Value::Null)
            }))
            .unwrap();
        table
    }

    fn gateway() -> (Arc<MemoryRemote>, RpcGateway) {
        let remote = Arc::new(MemoryRemote::new());
        let storage = Arc::new(SharedStorage::from_remote(
            remote.clone(),
            &StorageConfig::default(),
        ));
        let transactions = Arc::new(TransactionManager::new(storage));
        (remote, RpcGateway::new(Arc::new(routes()), transactions))
    }

    fn state_gateway() -> RpcGateway {
        let storage = Arc::new(SharedStorage::from_remote(
            Arc::new(MemoryRemote::new()),
            &StorageConfig::default(),
        ));
        let mut table = routes();
        register_state_routes(&mut table, storage.clone(), EventBus::new()).unwrap();
        RpcGateway::new(Arc::new(table), Arc::new(TransactionManager::new(storage)))
    }

    fn session_headers(owner: &str, sid: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(OWNER_HEADER.to_string(), owner.to_string());
        headers.insert(SESSION_HEADER.to_string(), sid.to_string());
        headers
    }

    fn post(path: &str, body: Value) -> GatewayRequest {
        GatewayRequest::new("POST", path).with_body(body)
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/nonexistent", json!([]))).await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body["error"], "NOT_FOUND");
        assert_eq!(reply.body["message"], "Route 'nonexistent' not found");
        // No transaction side effects
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_positional_args() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/add", json!([3, 4]))).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, json!({"result": 7}));
    }

    #[tokio::test]
    async fn test_bare_value_is_wrapped() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/echo", json!("hello"))).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, json!({"result": "hello"}));
    }

    #[tokio::test]
    async fn test_classified_error() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/fail", json!([]))).await;
        assert_eq!(reply.status, 403);
        assert_eq!(
            reply.body,
            json!({"error": "FORBIDDEN", "message": "Access denied"})
        );
    }

    #[tokio::test]
    async fn test_unclassified_error_does_not_leak() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/crash", json!([]))).await;
        assert_eq!(reply.status, 500);
        assert_eq!(
            reply.body,
            json!({"error": "INTERNAL_ERROR", "message": "Internal server error"})
        );
    }

    #[tokio::test]
    async fn test_owner_from_header() {
        let (_remote, gw) = gateway();
        let reply = gw
            .handle_request(post("/rpc/whoami", json!([])).with_header("X-Owner", "user_123"))
            .await;
        assert_eq!(reply.body["result"]["owner"], "user_123");

        let reply = gw.handle_request(post("/rpc/whoami", json!([]))).await;
        assert_eq!(reply.body["result"]["owner"], "anonymous");
        assert_eq!(reply.body["result"]["perm"], 7);
    }

    #[tokio::test]
    async fn test_route_perm_overrides_default() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(post("/rpc/readonly", json!([]))).await;
        assert_eq!(reply.status, 403);
        assert_eq!(reply.body["error"], "PERMISSION_DENIED");

        let (_remote, gw) = gateway();
        let gw = gw.with_default_perm(Perm::READ);
        let reply = gw.handle_request(post("/rpc/whoami", json!([]))).await;
        assert_eq!(reply.body["result"]["perm"], 4);
    }

    #[tokio::test]
    async fn test_health_and_fallback() {
        let (_remote, gw) = gateway();
        let reply = gw.handle_request(GatewayRequest::new("GET", "/health")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, json!({"status": "ok", "routes": 7}));

        let reply = gw.handle_request(GatewayRequest::new("GET", "/rpc/add")).await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body["message"], "Not found");

        let reply = gw.handle_request(post("/rpc/a/b", json!([]))).await;
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn test_commit_persists_session() {
        let (remote, gw) = gateway();
        let mut headers = HashMap::new();
        headers.insert("x-owner".to_string(), "alice".to_string());

        let first = gw.call("whoami", &headers, json!([])).await;
        let sid = first.session_id.clone().unwrap();
        assert!(remote.raw(&format!("kontract:do:session:{}", sid)).is_some());

        // Resume the committed session as the same owner
        headers.insert("x-session-id".to_string(), sid.clone());
        let second = gw.call("whoami", &headers, json!([])).await;
        assert_eq!(second.status, 200);
        assert_eq!(second.session_id.as_deref(), Some(sid.as_str()));

        // A different owner may not resume it
        headers.insert("x-owner".to_string(), "mallory".to_string());
        let third = gw.call("whoami", &headers, json!([])).await;
        assert_eq!(third.status, 403);
        assert_eq!(third.body.error(), Some("FORBIDDEN"));
    }

    #[tokio::test]
    async fn test_unknown_session_expired() {
        let (_remote, gw) = gateway();
        let mut headers = HashMap::new();
        headers.insert("x-session-id".to_string(), "missing".to_string());
        let response = gw.call("whoami", &headers, json!([])).await;
        assert_eq!(response.status, 401);
        assert_eq!(response.body.error(), Some("SESSION_EXPIRED"));
    }

    #[tokio::test]
    async fn test_failed_call_not_committed() {
        let (remote, gw) = gateway();
        let response = gw.call("fail", &HashMap::new(), json!([])).await;
        assert!(!response.is_success());
        assert!(response.session_id.is_none());
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let (remote, gw) = gateway();
        let gw = gw.with_call_timeout(Some(Duration::from_millis(20)));
        let response = gw.call("slow", &HashMap::new(), json!([])).await;
        assert_eq!(response.status, 504);
        assert_eq!(response.body.error(), Some("TIMEOUT"));
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (_remote, gw) = gateway();
        let metrics = Arc::new(Metrics::new().unwrap());
        let gw = gw.with_metrics(metrics.clone());

        gw.call("add", &HashMap::new(), json!([1, 2])).await;
        gw.call("nope", &HashMap::new(), json!([])).await;

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("kontract_rpc_calls_total{route=\"add\"} 1"));
        assert!(encoded.contains("kontract_rpc_calls_total{route=\"unknown\"} 1"));
        assert!(encoded.contains("kontract_rpc_errors_total{code=\"NOT_FOUND\"} 1"));
        assert!(encoded.contains("kontract_transactions_total{outcome=\"committed\"} 1"));
    }

    #[test]
    fn test_rpc_route_name() {
        assert_eq!(rpc_route_name("/rpc/add"), Some("add"));
        assert_eq!(rpc_route_name("/rpc/state.get"), Some("state.get"));
        assert_eq!(rpc_route_name("/rpc/"), None);
        assert_eq!(rpc_route_name("/rpc/a b"), None);
        assert_eq!(rpc_route_name("/other/add"), None);
    }

    #[test]
    fn test_normalize_args() {
        assert_eq!(normalize_args(json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(normalize_args(json!("x")), vec![json!("x")]);
        assert_eq!(normalize_args(Value::Null), vec![Value::Null]);
    }

    #[tokio::test]
    async fn test_state_routes_cannot_reach_sessions() {
        let gw = state_gateway();
        let mut alice = HashMap::new();
        alice.insert(OWNER_HEADER.to_string(), "alice".to_string());
        let sid = gw.call("whoami", &alice, json!([])).await.session_id.unwrap();
        let session_key = format!("session:{}", sid);

        let read = gw
            .handle_request(post("/rpc/state.get", json!([session_key])))
            .await;
        assert_eq!(read.status, 200);
        assert_eq!(read.body, json!({"result": null}));

        let forged = json!({"sid": sid, "owner": "mallory", "perm": 7, "committedAt": 0});
        let write = gw
            .handle_request(
                post("/rpc/state.set", json!([session_key, forged])).with_header("X-Owner", "mallory"),
            )
            .await;
        assert_eq!(write.status, 200);

        let resumed = gw.call("whoami", &session_headers("alice", &sid), json!([])).await;
        assert_eq!(resumed.status, 200);
        assert_eq!(resumed.session_id.as_deref(), Some(sid.as_str()));

        let hijack = gw.call("whoami", &session_headers("mallory", &sid), json!([])).await;
        assert_eq!(hijack.status, 403);

        // A planted value does not make an unknown session resumable
        let planted = gw
            .handle_request(post("/rpc/state.set", json!(["session:junk", 1])))
            .await;
        assert_eq!(planted.status, 200);
        let junk = gw
            .call("whoami", &session_headers("anonymous", "junk"), json!([]))
            .await;
        assert_eq!(junk.status, 401);
        assert_eq!(junk.body.error(), Some("SESSION_EXPIRED"));
    }

    #[tokio::test]
    async fn test_commit_hooks_run_only_after_commit() {
        let remote = Arc::new(MemoryRemote::new());
        let storage = Arc::new(SharedStorage::from_remote(
            remote.clone(),
            &StorageConfig::default(),
        ));
        let fired = Arc::new(AtomicUsize::new(0));

        let mut table = RouteTable::new();
        let (f, r) = (fired.clone(), remote.clone());
        table
            .register(Route::new("notify", move |ctx: CallContext, args: Vec<Value>| {
                let (fired, remote) = (f.clone(), r.clone());
                async move {
                    ctx.on_commit.push(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                    if args.first() == Some(&json!("offline")) {
                        remote.set_offline(true);
                    }
                    Ok::<_, CoreError>(Value::Null)
                }
            }))
            .unwrap();
        let gw = RpcGateway::new(Arc::new(table), Arc::new(TransactionManager::new(storage)));

        let ok = gw.call("notify", &HashMap::new(), json!([])).await;
        assert_eq!(ok.status, 200);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Commit fails once the remote goes away
        let failed = gw.call("notify", &HashMap::new(), json!(["offline"])).await;
        assert_eq!(failed.status, 500);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
