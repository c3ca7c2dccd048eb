//! Bridge connector and the two replication directions.
//!
//! The connector holds the long-lived handles to both stores and
//! guarantees the sink bucket exists. Exactly one of [`Replicator`]
//! (continuous forward sync) or [`Restorer`] (one-shot reverse restore)
//! drives it per process invocation.

mod checkpoint;
mod forward;
mod restore;
mod retry;

pub use checkpoint::{CheckpointStore, FsCheckpoints, NoopCheckpoints};
pub use forward::Replicator;
pub use restore::Restorer;
pub use retry::{DeadLetter, FsDeadLetter, NoopDeadLetter, RetryPolicy};

use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::store::{NatsSourceStore, S3SinkStore, SinkStore, SourceStore};

/// Static credentials for the sink store
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Ready-to-use handles to the source store and the sink bucket
pub struct Bridge {
    source: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
    bucket: String,
}

impl Bridge {
    /// Assemble a bridge from already-built store handles. Does not touch
    /// either store; call [`ensure_bucket`](Self::ensure_bucket) before use.
    pub fn new(
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            source,
            sink,
            bucket: bucket.into(),
        }
    }

    /// Connect to both stores and provision the sink bucket.
    ///
    /// Every failure here is fatal; the caller is expected to terminate.
    pub async fn connect(
        source_url: &str,
        sink_endpoint: &str,
        sink_region: &str,
        credentials: &Credentials,
        bucket: &str,
    ) -> Result<Self> {
        let source = NatsSourceStore::connect(source_url).await?;
        let sink = S3SinkStore::connect(
            sink_endpoint,
            sink_region,
            &credentials.access_key,
            &credentials.secret_key,
        )
        .await?;

        let bridge = Self::new(Arc::new(source), Arc::new(sink), bucket);
        bridge.ensure_bucket().await?;
        Ok(bridge)
    }

    /// Check that the sink bucket exists, creating it when absent.
    /// Creating an already-existing bucket is a no-op by construction.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let exists = self.sink.bucket_exists(&self.bucket).await.map_err(|e| {
            BridgeError::Connect(format!("failed to check bucket '{}': {}", self.bucket, e))
        })?;

        if !exists {
            self.sink.create_bucket(&self.bucket).await.map_err(|e| {
                BridgeError::Connect(format!("failed to create bucket '{}': {}", self.bucket, e))
            })?;
            tracing::info!(bucket = %self.bucket, "created sink bucket");
        }
        Ok(())
    }

    pub fn source(&self) -> &Arc<dyn SourceStore> {
        &self.source
    }

    pub fn sink(&self) -> &Arc<dyn SinkStore> {
        &self.sink
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}
