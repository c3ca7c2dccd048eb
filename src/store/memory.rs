//! In-memory source and sink stores.
//!
//! Used by the integration tests to drive the replication protocol without
//! a NATS server or an S3 endpoint, and handy for local dry runs. Both
//! stores support injecting per-name failures so the isolation behavior of
//! the replicator and restorer can be exercised.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{read_all, ByteStream, ChangeFeed, Collection, ObjectListing, SinkStore, SourceStore};
use crate::error::{BridgeError, Result};
use crate::types::{ChangeEvent, ListedObject};

#[derive(Clone)]
struct MemoryEntry {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory source store holding named collections
#[derive(Default)]
pub struct MemorySourceStore {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemorySourceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a collection, returning the concrete handle so
    /// tests can drive its feed and inject failures
    pub fn add_collection(&self, name: &str) -> Arc<MemoryCollection> {
        let collection = Arc::new(MemoryCollection::new(name));
        self.collections
            .lock()
            .insert(name.to_string(), collection.clone());
        collection
    }

    pub fn collection(&self, name: &str) -> Option<Arc<MemoryCollection>> {
        self.collections.lock().get(name).cloned()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn open_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        self.collections
            .lock()
            .get(name)
            .cloned()
            .map(|c| c as Arc<dyn Collection>)
            .ok_or_else(|| BridgeError::Source(format!("no such collection '{}'", name)))
    }

    async fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        let mut collections = self.collections.lock();
        if collections.contains_key(name) {
            return Err(BridgeError::AlreadyExists(format!("collection '{}'", name)));
        }
        let collection = Arc::new(MemoryCollection::new(name));
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }
}

/// One in-memory collection with a broadcast-style change feed
pub struct MemoryCollection {
    name: String,
    entries: Mutex<HashMap<String, MemoryEntry>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Result<ChangeEvent>>>>,
    fail_get: Mutex<HashSet<String>>,
    fail_put: Mutex<HashSet<String>>,
    gets: std::sync::atomic::AtomicU64,
}

impl MemoryCollection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            fail_get: Mutex::new(HashSet::new()),
            fail_put: Mutex::new(HashSet::new()),
            gets: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Seed an entry without emitting a change event (pre-subscription state)
    pub fn seed(&self, entry: &str, data: &[u8], modified: DateTime<Utc>) {
        self.entries.lock().insert(
            entry.to_string(),
            MemoryEntry {
                data: data.to_vec(),
                modified,
            },
        );
    }

    /// Write an entry and emit the matching live change event
    pub fn write(&self, entry: &str, data: &[u8], modified: DateTime<Utc>) {
        self.seed(entry, data, modified);
        self.emit(ChangeEvent {
            name: entry.to_string(),
            deleted: false,
            size: data.len() as u64,
            modified,
        });
    }

    /// Remove an entry and emit the matching tombstone
    pub fn delete(&self, entry: &str, modified: DateTime<Utc>) {
        let removed = self.entries.lock().remove(entry);
        self.emit(ChangeEvent {
            name: entry.to_string(),
            deleted: true,
            size: removed.map(|e| e.data.len() as u64).unwrap_or(0),
            modified,
        });
    }

    /// Push a raw event to every subscriber
    pub fn emit(&self, event: ChangeEvent) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Push a fatal feed error to every subscriber
    pub fn emit_feed_error(&self, message: &str) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(Err(BridgeError::Feed(message.to_string()))).is_ok());
    }

    /// Close all feeds; subscribers observe end-of-stream
    pub fn close_feed(&self) {
        self.watchers.lock().clear();
    }

    /// Number of live feed subscribers. Tests use this to wait until a
    /// replicator has subscribed before emitting events.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn fail_get_on(&self, entry: &str) {
        self.fail_get.lock().insert(entry.to_string());
    }

    pub fn fail_put_on(&self, entry: &str) {
        self.fail_put.lock().insert(entry.to_string());
    }

    pub fn contents(&self, entry: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(entry).map(|e| e.data.clone())
    }

    /// Calls to `get` so far
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn entries(&self) -> Result<Vec<ChangeEvent>> {
        let entries = self.entries.lock();
        let mut out: Vec<ChangeEvent> = entries
            .iter()
            .map(|(name, entry)| ChangeEvent {
                name: name.clone(),
                deleted: false,
                size: entry.data.len() as u64,
                modified: entry.modified,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get(&self, entry: &str) -> Result<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.lock().contains(entry) {
            return Err(BridgeError::Source(format!("injected get failure for '{}'", entry)));
        }
        let data = self
            .entries
            .lock()
            .get(entry)
            .map(|e| e.data.clone())
            .ok_or_else(|| BridgeError::NotFound(entry.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn put(&self, entry: &str, content: ByteStream) -> Result<u64> {
        if self.fail_put.lock().contains(entry) {
            return Err(BridgeError::Source(format!("injected put failure for '{}'", entry)));
        }
        let data = read_all(content).await?;
        let size = data.len() as u64;
        self.seed(entry, &data, Utc::now());
        Ok(size)
    }
}

/// One stored sink object, exposed to tests for assertions
#[derive(Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// In-memory sink store with injectable failures
#[derive(Default)]
pub struct MemorySinkStore {
    buckets: Mutex<HashMap<String, HashMap<String, StoredObject>>>,
    fail_put: Mutex<HashSet<String>>,
    fail_put_once: Mutex<HashSet<String>>,
    fail_get: Mutex<HashSet<String>>,
    fail_remove: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    unreachable: AtomicBool,
    puts: std::sync::atomic::AtomicU64,
}

impl MemorySinkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an object directly, bypassing failure injection
    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
    ) {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.to_vec(),
                    content_type: crate::types::SINK_CONTENT_TYPE.to_string(),
                    metadata,
                },
            );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.buckets.lock().get(bucket)?.get(key).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buckets
            .lock()
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().contains_key(bucket)
    }

    /// Make every sink call fail, as if the endpoint were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_put_on(&self, key: &str) {
        self.fail_put.lock().insert(key.to_string());
    }

    /// Fail the next put for `key`, then behave normally
    pub fn fail_put_once_on(&self, key: &str) {
        self.fail_put_once.lock().insert(key.to_string());
    }

    pub fn fail_get_on(&self, key: &str) {
        self.fail_get.lock().insert(key.to_string());
    }

    pub fn fail_remove_on(&self, key: &str) {
        self.fail_remove.lock().insert(key.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Successful put_object calls so far
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::Sink("sink unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SinkStore for MemorySinkStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.buckets.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.check_reachable()?;
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: ByteStream,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.check_reachable()?;
        if self.fail_put.lock().contains(key) {
            return Err(BridgeError::Sink(format!("injected put failure for '{}'", key)));
        }
        if self.fail_put_once.lock().remove(key) {
            return Err(BridgeError::Sink(format!(
                "injected transient put failure for '{}'",
                key
            )));
        }
        let data = read_all(content).await?;
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| BridgeError::Sink(format!("no such bucket '{}'", bucket)))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                metadata,
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_reachable()?;
        if self.fail_remove.lock().contains(key) {
            return Err(BridgeError::Sink(format!(
                "injected remove failure for '{}'",
                key
            )));
        }
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| BridgeError::Sink(format!("no such bucket '{}'", bucket)))?;
        match objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(BridgeError::NotFound(key.to_string())),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing> {
        self.check_reachable()?;
        if self.fail_listing.load(Ordering::SeqCst) {
            let err = vec![Err(BridgeError::Listing(
                "injected listing failure".to_string(),
            ))];
            return Ok(Box::pin(futures::stream::iter(err)));
        }
        let listed: Vec<Result<ListedObject>> = self
            .buckets
            .lock()
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, object)| {
                        Ok(ListedObject {
                            key: key.clone(),
                            size: object.data.len() as u64,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(listed)))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        self.check_reachable()?;
        if self.fail_get.lock().contains(key) {
            return Err(BridgeError::Sink(format!("injected get failure for '{}'", key)));
        }
        let data = self
            .buckets
            .lock()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}
