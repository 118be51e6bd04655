//! Routes: named handlers plus their metadata.

use crate::context::CallContext;
use crate::error::CoreError;
use crate::permission::Perm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Route metadata.
///
/// `perm` is the mask granted to calls of this route; `egroup` is an opaque
/// grouping tag passed through to handlers. Anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egroup: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RouteMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_perm(mut self, perm: Perm) -> Self {
        self.perm = Some(perm.bits());
        self
    }

    pub fn with_egroup(mut self, egroup: impl Into<String>) -> Self {
        self.egroup = Some(egroup.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Mask granted to a call: the declared one, else `default`.
    pub fn granted_perm(&self, default: Perm) -> Perm {
        self.perm.and_then(Perm::from_bits).unwrap_or(default)
    }
}

/// A route handler.
///
/// Implemented for any `Fn(CallContext, Vec<Value>) -> impl Future<Output =
/// Result<Value, CoreError>>`.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, CoreError>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, CoreError> {
        (self)(ctx, args).await
    }
}

/// A registered route. Immutable once built.
#[derive(Clone)]
pub struct Route {
    name: String,
    handler: Arc<dyn RouteHandler>,
    meta: RouteMeta,
}

impl Route {
    pub fn new(name: impl Into<String>, handler: impl RouteHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            meta: RouteMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: RouteMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &RouteMeta {
        &self.meta
    }

    pub fn handler(&self) -> &Arc<dyn RouteHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Exact-name route lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route.
    ///
    /// Rejects duplicate names and masks outside `0..=7`.
    pub fn register(&mut self, route: Route) -> Result<(), CoreError> {
        if let Some(perm) = route.meta.perm {
            if Perm::from_bits(perm).is_none() {
                return Err(CoreError::InvalidRoute {
                    name: route.name.clone(),
                    reason: format!("perm {} is not a 3-bit mask", perm),
                });
            }
        }
        if self.routes.contains_key(&route.name) {
            return Err(CoreError::InvalidRoute {
                name: route.name.clone(),
                reason: "already registered".to_string(),
            });
        }
        self.routes.insert(route.name.clone(), Arc::new(route));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }
}
