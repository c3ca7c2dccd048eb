//! NATS JetStream object-store backend for the source side

use std::sync::Arc;

use async_nats::jetstream::{self, object_store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use super::{ByteStream, ChangeFeed, Collection, SourceStore};
use crate::error::{BridgeError, Result};
use crate::types::ChangeEvent;

/// Source store backed by a NATS JetStream context
pub struct NatsSourceStore {
    jetstream: jetstream::Context,
}

impl NatsSourceStore {
    /// Connect to a NATS server and build a JetStream context
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(|e| {
            BridgeError::Connect(format!("failed to connect to NATS at {}: {}", url, e))
        })?;

        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }
}

#[async_trait]
impl SourceStore for NatsSourceStore {
    async fn open_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        let store = self.jetstream.get_object_store(name).await.map_err(|e| {
            BridgeError::Source(format!("failed to open object store '{}': {}", name, e))
        })?;

        Ok(Arc::new(NatsCollection {
            name: name.to_string(),
            store,
        }))
    }

    async fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        let config = object_store::Config {
            bucket: name.to_string(),
            description: Some("Restored from S3".to_string()),
            ..Default::default()
        };

        match self.jetstream.create_object_store(config).await {
            Ok(store) => Ok(Arc::new(NatsCollection {
                name: name.to_string(),
                store,
            })),
            Err(e) => {
                let msg = e.to_string();
                // JetStream reports a name collision as an in-use stream
                if msg.contains("already") || msg.contains("in use") {
                    Err(BridgeError::AlreadyExists(format!(
                        "object store '{}': {}",
                        name, msg
                    )))
                } else {
                    Err(BridgeError::Source(format!(
                        "failed to create object store '{}': {}",
                        name, msg
                    )))
                }
            }
        }
    }
}

struct NatsCollection {
    name: String,
    store: object_store::ObjectStore,
}

#[async_trait]
impl Collection for NatsCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<ChangeFeed> {
        // watch() starts at the current position; pre-existing entries are
        // picked up separately via entries()
        let watch = self.store.watch().await.map_err(|e| {
            BridgeError::Feed(format!("failed to watch '{}': {}", self.name, e))
        })?;

        let name = self.name.clone();
        let feed = watch.map(move |item| {
            item.map(event_from_info)
                .map_err(|e| BridgeError::Feed(format!("watch on '{}' failed: {}", name, e)))
        });

        Ok(Box::pin(feed))
    }

    async fn entries(&self) -> Result<Vec<ChangeEvent>> {
        let mut list = self.store.list().await.map_err(|e| {
            BridgeError::Source(format!("failed to list '{}': {}", self.name, e))
        })?;

        let mut out = Vec::new();
        while let Some(item) = list.next().await {
            let info = item.map_err(|e| {
                BridgeError::Source(format!("failed to list '{}': {}", self.name, e))
            })?;
            out.push(event_from_info(info));
        }
        Ok(out)
    }

    async fn get(&self, entry: &str) -> Result<ByteStream> {
        let object = self.store.get(entry).await.map_err(|e| {
            BridgeError::Source(format!("failed to get '{}': {}", entry, e))
        })?;
        Ok(Box::new(object))
    }

    async fn put(&self, entry: &str, mut content: ByteStream) -> Result<u64> {
        let info = self.store.put(entry, &mut content).await.map_err(|e| {
            BridgeError::Source(format!("failed to put '{}': {}", entry, e))
        })?;
        Ok(info.size as u64)
    }
}

fn event_from_info(info: object_store::ObjectInfo) -> ChangeEvent {
    let modified = info
        .modified
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.unix_timestamp(), t.nanosecond()))
        .unwrap_or_else(Utc::now);

    ChangeEvent {
        name: info.name,
        deleted: info.deleted,
        size: info.size as u64,
        modified,
    }
}
