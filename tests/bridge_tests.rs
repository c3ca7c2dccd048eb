//! End-to-end tests of the replication protocol over the in-memory
//! stores: forward sync semantics, per-item failure isolation, the
//! fatal/recoverable boundary, and the one-shot restore.
//!
//! Run with: cargo test --test bridge_tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio::task::JoinHandle;

use blobbridge::bridge::{CheckpointStore, FsCheckpoints, FsDeadLetter, RetryPolicy};
use blobbridge::store::memory::{MemoryCollection, MemorySinkStore, MemorySourceStore};
use blobbridge::types::{META_SOURCE_MODIFIED, META_SOURCE_SIZE, META_SOURCE_STORE};
use blobbridge::{Bridge, BridgeError, Replicator, Restorer, Result};

const BUCKET: &str = "backups";

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, secs).unwrap()
}

async fn bridge_over(
    source: &Arc<MemorySourceStore>,
    sink: &Arc<MemorySinkStore>,
) -> Arc<Bridge> {
    let bridge = Arc::new(Bridge::new(source.clone(), sink.clone(), BUCKET));
    bridge.ensure_bucket().await.unwrap();
    bridge
}

/// Spawn a replicator run and wait until it has subscribed to the feed,
/// so emitted events are guaranteed to be observed.
async fn spawn_replicator(
    replicator: Replicator,
    collection: &Arc<MemoryCollection>,
    name: &str,
) -> JoinHandle<Result<()>> {
    let name = name.to_string();
    let handle = tokio::spawn(async move { replicator.run(&name).await });
    while collection.watcher_count() == 0 {
        tokio::task::yield_now().await;
    }
    handle
}

#[tokio::test]
async fn overwrite_converges_to_last_write() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("a", b"first version", at(1));
    collection.write("a", b"second version", at(2));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    let object = sink.object(BUCKET, "store/a").expect("object replicated");
    assert_eq!(object.data, b"second version".to_vec());
    assert_eq!(sink.keys(BUCKET), vec!["store/a"]);
}

#[tokio::test]
async fn delete_of_absent_key_is_a_tolerated_noop() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    // tombstone for an entry that never reached the sink
    collection.delete("ghost", at(1));
    // a later event still gets processed
    collection.write("real", b"payload", at(2));
    collection.close_feed();

    // the run ends cleanly; the missing key was not an error
    handle.await.unwrap().unwrap();
    assert_eq!(sink.keys(BUCKET), vec!["store/real"]);
}

#[tokio::test]
async fn delete_removes_replicated_object() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("doomed", b"bytes", at(1));
    collection.delete("doomed", at(2));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.keys(BUCKET), Vec::<String>::new());
}

#[tokio::test]
async fn single_bad_entry_does_not_stop_the_stream() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    collection.fail_get_on("bad");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("a", b"aaa", at(1));
    collection.write("bad", b"never fetched", at(2));
    collection.write("c", b"ccc", at(3));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.keys(BUCKET), vec!["store/a", "store/c"]);
}

#[tokio::test]
async fn sink_put_failure_does_not_terminate_the_loop() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    sink.fail_put_on("store/a");
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("a", b"dropped", at(1));
    collection.write("c", b"kept", at(2));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.keys(BUCKET), vec!["store/c"]);
}

#[tokio::test]
async fn unreachable_sink_is_fatal_before_the_loop() {
    let source = MemorySourceStore::new();
    source.add_collection("store");
    let sink = MemorySinkStore::new();
    sink.set_unreachable(true);

    let bridge = Bridge::new(source, sink.clone(), BUCKET);
    let err = bridge.ensure_bucket().await.unwrap_err();
    assert!(matches!(err, BridgeError::Connect(_)));
    // nothing was written; the replicator never ran
    assert_eq!(sink.put_count(), 0);
}

#[tokio::test]
async fn feed_error_is_fatal() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("a", b"applied", at(1));
    collection.emit_feed_error("server gone");

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Feed(_)));
    // the event before the disconnect was still applied
    assert_eq!(sink.keys(BUCKET), vec!["store/a"]);
}

#[tokio::test]
async fn missing_collection_is_fatal_setup_error() {
    let source = MemorySourceStore::new();
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    assert!(replicator.run("nope").await.is_err());
}

#[tokio::test]
async fn forward_sync_records_provenance_metadata() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("my-objects");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "my-objects").await;

    let modified = at(30);
    let content = [7u8; 42];
    collection.write("report.bin", &content, modified);
    collection.close_feed();
    handle.await.unwrap().unwrap();

    let object = sink.object(BUCKET, "my-objects/report.bin").unwrap();
    assert_eq!(object.data, content.to_vec());
    assert_eq!(object.content_type, "application/octet-stream");
    assert_eq!(object.metadata[META_SOURCE_STORE], "my-objects");
    assert_eq!(object.metadata[META_SOURCE_SIZE], "42");
    assert_eq!(object.metadata[META_SOURCE_MODIFIED], modified.to_rfc3339());
}

#[tokio::test]
async fn entries_present_before_subscription_are_backfilled() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    collection.seed("old-a", b"pre-existing", at(1));
    collection.seed("old-b", b"also here", at(2));
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.keys(BUCKET), vec!["store/old-a", "store/old-b"]);
}

#[tokio::test]
async fn backfilled_entry_is_not_applied_twice() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    collection.seed("a", b"payload", at(5));
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;

    // the feed replays the same revision the backfill already applied
    collection.emit(blobbridge::ChangeEvent {
        name: "a".to_string(),
        deleted: false,
        size: 7,
        modified: at(5),
    });
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.keys(BUCKET), vec!["store/a"]);
    assert_eq!(sink.put_count(), 1);
}

#[tokio::test]
async fn checkpoint_skips_already_applied_events_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(FsCheckpoints::open(dir.path().join("cp.json")).unwrap());

    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    // first run applies "a" and records the checkpoint
    let replicator = Replicator::new(bridge.clone())
        .with_retry(RetryPolicy::none())
        .with_checkpoints(checkpoints.clone());
    let handle = spawn_replicator(replicator, &collection, "store").await;
    collection.write("a", b"v1", at(10));
    collection.close_feed();
    handle.await.unwrap().unwrap();
    assert_eq!(sink.put_count(), 1);

    // second run: "a" (unchanged since the marker) is skipped by both the
    // backfill and the feed; a newer entry still flows
    let reopened = Arc::new(FsCheckpoints::open(dir.path().join("cp.json")).unwrap());
    let replicator = Replicator::new(bridge)
        .with_retry(RetryPolicy::none())
        .with_checkpoints(reopened);
    let handle = spawn_replicator(replicator, &collection, "store").await;
    collection.write("b", b"new", at(20));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.put_count(), 2);
    assert_eq!(sink.keys(BUCKET), vec!["store/a", "store/b"]);
}

#[tokio::test]
async fn sharded_fanout_preserves_per_name_order() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge)
        .with_retry(RetryPolicy::none())
        .with_shards(4);
    let handle = spawn_replicator(replicator, &collection, "store").await;

    for round in 0u32..10 {
        for name in ["x", "y", "z"] {
            let body = format!("{}-{}", name, round);
            collection.write(name, body.as_bytes(), at(round));
        }
    }
    collection.close_feed();
    handle.await.unwrap().unwrap();

    for name in ["x", "y", "z"] {
        let object = sink.object(BUCKET, &format!("store/{}", name)).unwrap();
        assert_eq!(object.data, format!("{}-9", name).into_bytes());
    }
}

#[tokio::test]
async fn sharded_run_checkpoints_up_to_the_newest_event() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(FsCheckpoints::open(dir.path().join("cp.json")).unwrap());

    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge)
        .with_retry(RetryPolicy::none())
        .with_checkpoints(checkpoints)
        .with_shards(4);
    let handle = spawn_replicator(replicator, &collection, "store").await;

    for (i, name) in ["x", "y", "z", "w"].into_iter().enumerate() {
        collection.write(name, b"payload", at(i as u32 + 1));
    }
    collection.close_feed();
    handle.await.unwrap().unwrap();

    // a clean shutdown drains every shard, so the persisted marker is the
    // newest applied timestamp rather than whichever shard finished last
    let reopened = FsCheckpoints::open(dir.path().join("cp.json")).unwrap();
    assert_eq!(reopened.load("store").await.unwrap(), Some(at(4)));
}

#[tokio::test]
async fn retry_streams_a_fresh_copy_from_the_source_per_attempt() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    sink.fail_put_once_on("store/a");
    let bridge = bridge_over(&source, &sink).await;

    let replicator =
        Replicator::new(bridge).with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("a", b"payload", at(1));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    // the failed first attempt consumed its stream; the second attempt
    // re-opened the entry instead of replaying a buffered copy
    assert_eq!(collection.get_count(), 2);
    assert_eq!(
        sink.object(BUCKET, "store/a").unwrap().data,
        b"payload".to_vec()
    );
}

#[tokio::test]
async fn exhausted_retries_land_in_the_dead_letter_file() {
    let dir = tempfile::tempdir().unwrap();
    let dead_letter_path = dir.path().join("dead.jsonl");

    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    sink.fail_put_on("store/bad");
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge)
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
        .with_dead_letter(Arc::new(FsDeadLetter::new(&dead_letter_path)));
    let handle = spawn_replicator(replicator, &collection, "store").await;

    collection.write("bad", b"unlucky", at(1));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    let text = std::fs::read_to_string(&dead_letter_path).unwrap();
    let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(line["collection"], "store");
    assert_eq!(line["entry"], "bad");
}

#[tokio::test]
async fn restore_recreates_every_prefixed_entry() {
    let source = MemorySourceStore::new();
    let sink = MemorySinkStore::new();
    sink.insert_object(BUCKET, "store/a", b"aaa", HashMap::new());
    sink.insert_object(BUCKET, "store/b", b"bbb", HashMap::new());
    sink.insert_object(BUCKET, "store/sub/c", b"nested", HashMap::new());
    sink.insert_object(BUCKET, "other/x", b"foreign", HashMap::new());
    let bridge = bridge_over(&source, &sink).await;

    let restorer = Restorer::new(bridge).with_retry(RetryPolicy::none());
    let processed = restorer.restore("store").await.unwrap();

    assert_eq!(processed, 3);
    let collection = source.collection("store").unwrap();
    assert_eq!(collection.entry_names(), vec!["a", "b", "sub/c"]);
    assert_eq!(collection.contents("sub/c").unwrap(), b"nested".to_vec());
}

#[tokio::test]
async fn restore_falls_back_to_an_existing_collection() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    collection.seed("kept", b"original", at(1));
    let sink = MemorySinkStore::new();
    sink.insert_object(BUCKET, "store/new", b"from sink", HashMap::new());
    let bridge = bridge_over(&source, &sink).await;

    let restorer = Restorer::new(bridge).with_retry(RetryPolicy::none());
    let processed = restorer.restore("store").await.unwrap();

    assert_eq!(processed, 1);
    assert_eq!(collection.entry_names(), vec!["kept", "new"]);
}

#[tokio::test]
async fn restore_isolates_per_object_failures() {
    let source = MemorySourceStore::new();
    let sink = MemorySinkStore::new();
    sink.insert_object(BUCKET, "store/a", b"aaa", HashMap::new());
    sink.insert_object(BUCKET, "store/b", b"bbb", HashMap::new());
    sink.insert_object(BUCKET, "store/c", b"ccc", HashMap::new());
    sink.fail_get_on("store/b");
    let bridge = bridge_over(&source, &sink).await;

    let restorer = Restorer::new(bridge).with_retry(RetryPolicy::none());
    let processed = restorer.restore("store").await.unwrap();

    assert_eq!(processed, 3);
    let collection = source.collection("store").unwrap();
    assert_eq!(collection.entry_names(), vec!["a", "c"]);
}

#[tokio::test]
async fn restore_aborts_on_listing_failure() {
    let source = MemorySourceStore::new();
    let sink = MemorySinkStore::new();
    sink.insert_object(BUCKET, "store/a", b"aaa", HashMap::new());
    sink.fail_listing(true);
    let bridge = bridge_over(&source, &sink).await;

    let restorer = Restorer::new(bridge).with_retry(RetryPolicy::none());
    let err = restorer.restore("store").await.unwrap_err();
    assert!(matches!(err, BridgeError::Listing(_)));
    assert!(source.collection("store").unwrap().entry_names().is_empty());
}

#[tokio::test]
async fn forward_then_restore_round_trips_contents() {
    let source = MemorySourceStore::new();
    let collection = source.add_collection("store");
    let sink = MemorySinkStore::new();
    let bridge = bridge_over(&source, &sink).await;

    let replicator = Replicator::new(bridge.clone()).with_retry(RetryPolicy::none());
    let handle = spawn_replicator(replicator, &collection, "store").await;
    collection.write("doc", "важные данные".as_bytes(), at(1));
    collection.write("sub/nested", b"deep", at(2));
    collection.close_feed();
    handle.await.unwrap().unwrap();

    // wipe the source and rebuild it from the sink
    let rebuilt_source = MemorySourceStore::new();
    let bridge = Arc::new(Bridge::new(rebuilt_source.clone(), sink.clone(), BUCKET));
    let restorer = Restorer::new(bridge).with_retry(RetryPolicy::none());
    let processed = restorer.restore("store").await.unwrap();

    assert_eq!(processed, 2);
    let restored = rebuilt_source.collection("store").unwrap();
    assert_eq!(restored.entry_names(), vec!["doc", "sub/nested"]);
    assert_eq!(
        restored.contents("doc").unwrap(),
        "важные данные".as_bytes().to_vec()
    );
}
