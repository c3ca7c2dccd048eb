//! Store contracts for the two sides of the bridge.
//!
//! The replication protocol only ever talks to these traits; the real
//! backends (`nats` for the source, `s3` for the sink) and the in-memory
//! test double (`memory`) all plug in behind them.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::types::{ChangeEvent, ListedObject};

pub mod memory;
pub mod nats;
pub mod s3;

pub use nats::NatsSourceStore;
pub use s3::S3SinkStore;

/// Streamed object content
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Live feed of mutations on a watched collection. Ends when the
/// subscription is stopped; a stream-level error is a fatal feed error.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Lazy enumeration of sink keys under a prefix
pub type ObjectListing = Pin<Box<dyn Stream<Item = Result<ListedObject>> + Send>>;

/// The versioned blob store the bridge replicates out of
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Open an existing collection. Does not create.
    async fn open_collection(&self, name: &str) -> Result<Arc<dyn Collection>>;

    /// Create a collection. Returns `AlreadyExists` when the name is taken.
    async fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>>;
}

/// One named collection inside the source store
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to mutations from the current position onward
    async fn watch(&self) -> Result<ChangeFeed>;

    /// One-shot enumeration of the entries that exist right now.
    /// Used to backfill entries that predate the watch subscription.
    async fn entries(&self) -> Result<Vec<ChangeEvent>>;

    async fn get(&self, entry: &str) -> Result<ByteStream>;

    /// Create or overwrite an entry from streamed content, returning the
    /// number of bytes written
    async fn put(&self, entry: &str, content: ByteStream) -> Result<u64>;
}

/// The S3-compatible store the bridge replicates into
#[async_trait]
pub trait SinkStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Create or overwrite an object. Content length need not be known up
    /// front.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: ByteStream,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    /// Delete an object. A missing key surfaces as `NotFound`.
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Recursively enumerate keys under `prefix`, in no particular order
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream>;
}

/// Drain a content stream into memory
pub async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}
