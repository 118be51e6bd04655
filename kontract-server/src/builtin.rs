//! Built-in `state.*` routes over shared storage.
//!
//! Each route checks the caller's mask against the table operation it
//! performs and publishes a [`ChangeEvent`] on the [`STATE_RESOURCE`]
//! resource once the call's transaction commits.
//!
//! Caller keys live under [`STATE_KEY_PREFIX`] in shared storage, so they
//! never reach records the gateway keeps there (`session:<sid>`).

use kontract_core::{
    check_table_permission, CallContext, CoreError, EventBus, Route, RouteMeta, RouteTable,
    TableOperation,
};
use kontract_protocol::ChangeEvent;
use kontract_storage::SharedStorage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Resource name change events are published under.
pub const STATE_RESOURCE: &str = "state";

/// Storage namespace for caller keys.
pub const STATE_KEY_PREFIX: &str = "state:";

const STATE_EGROUP: &str = "state";

fn key_arg(args: &[Value]) -> Result<String, CoreError> {
    match args.first() {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(CoreError::bad_request("first argument must be a non-empty key")),
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, key)
}

fn emit_on_commit(ctx: &CallContext, bus: &EventBus, event: ChangeEvent) {
    let bus = bus.clone();
    ctx.on_commit.push(move || {
        bus.emit(STATE_RESOURCE, &event);
    });
}

fn ttl_arg(args: &[Value]) -> Result<Option<Duration>, CoreError> {
    match args.get(2) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| CoreError::bad_request("ttl must be a non-negative integer (ms)")),
    }
}

/// `state.get(key)`: the stored value, or `null`.
async fn get(storage: &SharedStorage, ctx: &CallContext, args: &[Value]) -> Result<Value, CoreError> {
    check_table_permission(ctx.perm, TableOperation::Read)?;
    let key = key_arg(args)?;
    Ok(storage.get(&storage_key(&key)).await?.unwrap_or(Value::Null))
}

/// `state.set(key, value, ttlMs?)`: returns the value written.
async fn set(
    storage: &SharedStorage,
    bus: &EventBus,
    ctx: &CallContext,
    args: &[Value],
) -> Result<Value, CoreError> {
    check_table_permission(ctx.perm, TableOperation::Write)?;
    let key = key_arg(args)?;
    let value = args.get(1).cloned().unwrap_or(Value::Null);
    let ttl = ttl_arg(args)?;

    let stored = storage_key(&key);
    let previous = storage.get(&stored).await?;
    storage.set(&stored, value.clone(), ttl).await?;

    let event = match previous {
        Some(old) => ChangeEvent::update(key.as_str(), value.clone(), old),
        None => ChangeEvent::insert(key.as_str(), value.clone()),
    };
    emit_on_commit(ctx, bus, event);
    Ok(value)
}

/// `state.delete(key)`: whether a value was present.
async fn delete(
    storage: &SharedStorage,
    bus: &EventBus,
    ctx: &CallContext,
    args: &[Value],
) -> Result<Value, CoreError> {
    check_table_permission(ctx.perm, TableOperation::Delete)?;
    let key = key_arg(args)?;

    let stored = storage_key(&key);
    let previous = storage.get(&stored).await?;
    storage.delete(&stored).await?;

    let existed = previous.is_some();
    if existed {
        emit_on_commit(ctx, bus, ChangeEvent::delete(key.as_str(), previous));
    }
    Ok(Value::Bool(existed))
}

/// Registers `state.get`, `state.set` and `state.delete`.
pub fn register_state_routes(
    table: &mut RouteTable,
    storage: Arc<SharedStorage>,
    bus: EventBus,
) -> Result<(), CoreError> {
    let meta = RouteMeta::new().with_egroup(STATE_EGROUP);

    let s = storage.clone();
    table.register(
        Route::new("state.get", move |ctx: CallContext, args: Vec<Value>| {
            let storage = s.clone();
            async move { get(&storage, &ctx, &args).await }
        })
        .with_meta(meta.clone()),
    )?;

    let (s, b) = (storage.clone(), bus.clone());
    table.register(
        Route::new("state.set", move |ctx: CallContext, args: Vec<Value>| {
            let (storage, bus) = (s.clone(), b.clone());
            async move { set(&storage, &bus, &ctx, &args).await }
        })
        .with_meta(meta.clone()),
    )?;

    table.register(
        Route::new("state.delete", move |ctx: CallContext, args: Vec<Value>| {
            let (storage, bus) = (storage.clone(), bus.clone());
            async move { delete(&storage, &bus, &ctx, &args).await }
        })
        .with_meta(meta),
    )?;

    Ok(())
}
