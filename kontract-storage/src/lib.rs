//! # kontract-storage
//!
//! Storage layer for kontract.
//!
//! This crate provides:
//! - The remote-tier client contract and an in-process implementation
//! - A two-tier store (local hot tier, durable remote tier) with TTL expiry
//! - A durable-only key/value store
//! - Shared storage that routes keys to the right store

pub mod entry;
pub mod error;
pub mod kv;
pub mod remote;
pub mod shared;
pub mod two_tier;

pub use entry::{now_millis, Entry};
pub use error::StorageError;
pub use kv::KeyValueStore;
pub use remote::{MemoryRemote, RemoteClient};
pub use shared::{SharedStorage, StorageConfig, Tier};
pub use two_tier::TwoTierStore;
