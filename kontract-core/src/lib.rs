//! # kontract-core
//!
//! Call-handling core for kontract.
//!
//! This crate provides:
//! - The 3-bit read/write/execute permission model
//! - The closed error taxonomy with status and code per kind
//! - Route metadata, handlers and the route table
//! - Session transactions wrapping each call
//! - In-process publish/subscribe for change events

pub mod context;
pub mod error;
pub mod events;
pub mod permission;
pub mod route;
pub mod transaction;

pub use context::{CallContext, CommitHooks, RouteIdentity};
pub use error::CoreError;
pub use events::{EventBus, Subscription};
pub use permission::{
    check_field_permissions, check_table_permission, verify_access, Perm, Principal,
    TableOperation,
};
pub use route::{Route, RouteHandler, RouteMeta, RouteTable};
pub use transaction::{
    SessionRecord, Transaction, TransactionManager, TransactionState, ANONYMOUS_OWNER,
};
