//! Blobbridge - NATS object store ↔ S3 replication bridge
//!
//! Continuously mirrors one or more source-store collections into an
//! S3-compatible bucket, and can rebuild a collection from the bucket in
//! a one-shot restore.

pub mod bridge;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use bridge::{Bridge, Credentials, Replicator, Restorer};
pub use error::{BridgeError, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
