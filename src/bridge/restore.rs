//! Reverse restorer: one-shot sink-bucket → source-collection rebuild.
//!
//! Used for disaster recovery or cross-environment seeding. Only entry
//! names are reconstructed; the size and modified time recorded on the
//! sink objects are not reapplied, the source store assigns fresh
//! metadata on creation.

use std::sync::Arc;

use futures::StreamExt;

use super::retry::{DeadLetter, NoopDeadLetter, RetryPolicy};
use super::Bridge;
use crate::error::{BridgeError, Result};
use crate::types::{collection_prefix, entry_name};

/// One-shot reconstruction of a collection from the sink bucket
pub struct Restorer {
    bridge: Arc<Bridge>,
    dead_letter: Arc<dyn DeadLetter>,
    retry: RetryPolicy,
}

impl Restorer {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            dead_letter: Arc::new(NoopDeadLetter),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetter>) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Restore every sink object under the collection's prefix into the
    /// (created-or-opened) collection. Returns the number of keys
    /// processed; per-key failures are logged and skipped, a partially
    /// restored collection is a reported-but-not-fatal outcome.
    pub async fn restore(&self, collection_name: &str) -> Result<usize> {
        let source = self.bridge.source();
        let collection = match source.create_collection(collection_name).await {
            Ok(collection) => {
                tracing::info!(collection = collection_name, "created target collection");
                collection
            }
            Err(create_err) => match source.open_collection(collection_name).await {
                Ok(collection) => collection,
                Err(open_err) => {
                    return Err(BridgeError::Source(format!(
                        "failed to create ({}) or open ({}) collection '{}'",
                        create_err, open_err, collection_name
                    )));
                }
            },
        };

        let prefix = collection_prefix(collection_name);
        let mut listing = self
            .bridge
            .sink()
            .list_objects(self.bridge.bucket(), &prefix)
            .await?;

        let mut processed = 0usize;
        while let Some(item) = listing.next().await {
            // an enumeration error means the sink cannot be reliably
            // listed; abort the whole restore
            let object = item.map_err(|e| match e {
                BridgeError::Listing(_) => e,
                other => BridgeError::Listing(other.to_string()),
            })?;
            processed += 1;

            let Some(entry) = entry_name(&prefix, &object.key) else {
                tracing::warn!(key = %object.key, "listed key outside collection prefix, skipping");
                continue;
            };

            let result = self
                .retry
                .run(|| async {
                    let content = self
                        .bridge
                        .sink()
                        .get_object(self.bridge.bucket(), &object.key)
                        .await?;
                    collection.put(entry, content).await
                })
                .await;

            match result {
                Ok(size) => tracing::info!(entry = %entry, size, "restored entry"),
                Err(e) => {
                    tracing::error!(entry = %entry, "failed to restore: {}", e);
                    self.dead_letter.record(collection_name, entry, &e).await;
                }
            }
        }

        tracing::info!(
            collection = collection_name,
            processed,
            "restore finished"
        );
        Ok(processed)
    }
}
