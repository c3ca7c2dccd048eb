//! Forward replicator: continuous source-collection → sink-bucket sync.
//!
//! One sequential consumer per shard; events for the same entry name
//! always land on the same shard, so per-name ordering holds regardless
//! of fan-out. With the default single shard this is the plain
//! one-event-at-a-time loop.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::checkpoint::{CheckpointStore, NoopCheckpoints};
use super::retry::{DeadLetter, NoopDeadLetter, RetryPolicy};
use super::Bridge;
use crate::error::Result;
use crate::store::{Collection, SinkStore};
use crate::types::{object_key, provenance_metadata, ChangeEvent, SINK_CONTENT_TYPE};

/// Continuous forward sync of one collection into the sink bucket
pub struct Replicator {
    bridge: Arc<Bridge>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letter: Arc<dyn DeadLetter>,
    retry: RetryPolicy,
    shards: usize,
}

impl Replicator {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            checkpoints: Arc::new(NoopCheckpoints),
            dead_letter: Arc::new(NoopDeadLetter),
            retry: RetryPolicy::default(),
            shards: 1,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetter>) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Replicate `collection_name` until the feed closes (external stop)
    /// or errors (fatal).
    ///
    /// Opens the collection but never creates it; a collection that cannot
    /// be addressed fails the run before any event is consumed.
    pub async fn run(&self, collection_name: &str) -> Result<()> {
        let collection = self.bridge.source().open_collection(collection_name).await?;
        let mut feed = collection.watch().await?;

        let marker = match self.checkpoints.load(collection_name).await {
            Ok(marker) => marker,
            Err(e) => {
                tracing::warn!(
                    collection = collection_name,
                    "failed to load checkpoint, starting live: {}",
                    e
                );
                None
            }
        };

        let ctx = Arc::new(SyncContext {
            collection_name: collection_name.to_string(),
            collection: collection.clone(),
            sink: self.bridge.sink().clone(),
            bucket: self.bridge.bucket().to_string(),
            retry: self.retry,
            dead_letter: self.dead_letter.clone(),
            checkpoints: self.checkpoints.clone(),
            gate: CheckpointGate::new(),
        });
        let mut dispatcher = Dispatcher::start(ctx, self.shards);

        // Backfill: entries that predate the subscription never show up on
        // the feed, so enumerate them once and apply each as a synthetic
        // update. Names applied here are remembered so the feed's replay of
        // the same enumeration window is not double-applied.
        let mut window: HashMap<String, DateTime<Utc>> = HashMap::new();
        match collection.entries().await {
            Ok(mut existing) => {
                // oldest first, so the checkpoint frontier never persists a
                // timestamp ahead of an older entry still on a shard queue
                existing.sort_by_key(|event| event.modified);
                for event in existing {
                    if event.deleted {
                        continue;
                    }
                    if let Some(marker) = marker {
                        if event.modified <= marker {
                            continue;
                        }
                    }
                    window.insert(event.name.clone(), event.modified);
                    dispatcher.dispatch(event).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    collection = collection_name,
                    "failed to enumerate existing entries, skipping backfill: {}",
                    e
                );
            }
        }

        tracing::info!(
            collection = collection_name,
            shards = self.shards,
            "watching collection for changes"
        );

        let mut feed_result = Ok(());
        while let Some(item) = feed.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    feed_result = Err(e);
                    break;
                }
            };

            if let Some(marker) = marker {
                if event.modified <= marker {
                    tracing::debug!(entry = %event.name, "skipping event at or before checkpoint");
                    continue;
                }
            }

            if let Some(applied) = window.remove(&event.name) {
                if !event.deleted && event.modified == applied {
                    tracing::debug!(entry = %event.name, "already applied by backfill");
                    continue;
                }
            }

            dispatcher.dispatch(event).await;
        }

        dispatcher.shutdown().await;
        feed_result?;

        tracing::info!(collection = collection_name, "change feed closed");
        Ok(())
    }
}

struct SyncContext {
    collection_name: String,
    collection: Arc<dyn Collection>,
    sink: Arc<dyn SinkStore>,
    bucket: String,
    retry: RetryPolicy,
    dead_letter: Arc<dyn DeadLetter>,
    checkpoints: Arc<dyn CheckpointStore>,
    gate: CheckpointGate,
}

/// Orders checkpoint persistence behind the shard fan-out. Every dispatched
/// event takes a sequence number; the marker may only advance to an event's
/// timestamp once every event dispatched before it has finished. Without
/// this a fast shard could persist a marker past an event still queued on a
/// slow shard, and a restart would skip that event.
struct CheckpointGate {
    inner: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    next_seq: u64,
    frontier: u64,
    done: BTreeMap<u64, Option<DateTime<Utc>>>,
}

impl CheckpointGate {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GateState::default()),
        }
    }

    fn begin(&self) -> u64 {
        let mut state = self.inner.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Report the outcome of `seq`: the timestamp it applied, or `None`
    /// when it failed or was dropped. Returns a marker to persist when the
    /// contiguous frontier moved past at least one applied event.
    fn complete(&self, seq: u64, applied: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let mut state = self.inner.lock();
        state.done.insert(seq, applied);
        let mut marker: Option<DateTime<Utc>> = None;
        loop {
            let frontier = state.frontier;
            match state.done.remove(&frontier) {
                Some(applied) => {
                    state.frontier += 1;
                    if let Some(ts) = applied {
                        marker = Some(marker.map_or(ts, |m| m.max(ts)));
                    }
                }
                None => break,
            }
        }
        marker
    }
}

enum Dispatcher {
    Inline(Arc<SyncContext>),
    Sharded {
        ctx: Arc<SyncContext>,
        senders: Vec<mpsc::Sender<(u64, ChangeEvent)>>,
        handles: Vec<JoinHandle<()>>,
    },
}

impl Dispatcher {
    fn start(ctx: Arc<SyncContext>, shards: usize) -> Self {
        if shards <= 1 {
            return Dispatcher::Inline(ctx);
        }

        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<(u64, ChangeEvent)>(64);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                while let Some((seq, event)) = rx.recv().await {
                    apply_event(&ctx, seq, &event).await;
                }
                tracing::debug!(shard, "shard worker drained");
            }));
            senders.push(tx);
        }
        Dispatcher::Sharded {
            ctx,
            senders,
            handles,
        }
    }

    async fn dispatch(&mut self, event: ChangeEvent) {
        match self {
            Dispatcher::Inline(ctx) => {
                let seq = ctx.gate.begin();
                apply_event(ctx, seq, &event).await;
            }
            Dispatcher::Sharded { ctx, senders, .. } => {
                let seq = ctx.gate.begin();
                let shard = shard_for(&event.name, senders.len());
                if senders[shard].send((seq, event)).await.is_err() {
                    tracing::warn!(shard, "shard worker gone, dropping event");
                    ctx.gate.complete(seq, None);
                }
            }
        }
    }

    async fn shutdown(self) {
        if let Dispatcher::Sharded { senders, handles, .. } = self {
            drop(senders);
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

fn shard_for(name: &str, shards: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

/// Apply one change event and release its checkpoint sequence. Failures
/// stay inside the item boundary: they are logged, dead-lettered after
/// retry exhaustion, and the loop moves on.
async fn apply_event(ctx: &SyncContext, seq: u64, event: &ChangeEvent) {
    let applied = sync_entry(ctx, event).await.then_some(event.modified);
    if let Some(marker) = ctx.gate.complete(seq, applied) {
        if let Err(e) = ctx.checkpoints.store(&ctx.collection_name, marker).await {
            tracing::warn!(collection = %ctx.collection_name, "failed to store checkpoint: {}", e);
        }
    }
}

/// Mirror one event into the sink, returning whether it landed.
async fn sync_entry(ctx: &SyncContext, event: &ChangeEvent) -> bool {
    let key = object_key(&ctx.collection_name, &event.name);

    if event.deleted {
        match ctx
            .retry
            .run(|| ctx.sink.remove_object(&ctx.bucket, &key))
            .await
        {
            Ok(()) => tracing::info!(key = %key, "deleted from sink"),
            Err(e) if e.is_not_found() => {
                // at-least-once delivery: the key may already be gone
                tracing::debug!(key = %key, "delete for absent key, already converged");
            }
            Err(e) => {
                tracing::error!(key = %key, "failed to delete from sink: {}", e);
                ctx.dead_letter
                    .record(&ctx.collection_name, &event.name, &e)
                    .await;
                return false;
            }
        }
    } else {
        // Each attempt opens a fresh stream from the source so the body is
        // piped through without ever being buffered whole on this side.
        let metadata = provenance_metadata(&ctx.collection_name, event);
        let put = ctx
            .retry
            .run(|| async {
                let body = ctx.collection.get(&event.name).await?;
                ctx.sink
                    .put_object(&ctx.bucket, &key, body, SINK_CONTENT_TYPE, metadata.clone())
                    .await
            })
            .await;

        match put {
            Ok(()) => tracing::info!(key = %key, size = event.size, "uploaded to sink"),
            Err(e) => {
                tracing::error!(key = %key, "failed to replicate to sink: {}", e);
                ctx.dead_letter
                    .record(&ctx.collection_name, &event.name, &e)
                    .await;
                return false;
            }
        }
    }

    true
}
