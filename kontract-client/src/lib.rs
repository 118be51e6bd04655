//! # kontract-client
//!
//! Rust client library for kontract.
//!
//! The client performs the handshake (optionally negotiating an AEAD
//! suite from a shared secret), multiplexes calls over one connection by
//! correlation id, and fans pushed change events out to any number of
//! receivers.
//!
//! ## Example
//!
//! ```ignore
//! use kontract_client::{Client, ConnectionConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("127.0.0.1:8787".parse()?)
//!         .with_client_name("example")
//!         .with_owner("alice");
//!     let client = Client::new(config);
//!     client.connect().await?;
//!
//!     client.call("state.set", json!(["greeting", "hello"])).await?;
//!     let value = client.call("state.get", json!(["greeting"])).await?;
//!     println!("{}", value);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod error;

pub use client::{CallResult, Client};
pub use connection::{Connection, ConnectionConfig, Reply};
pub use error::ClientError;
