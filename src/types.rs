//! Core types for blobbridge

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type applied to every replicated sink object
pub const SINK_CONTENT_TYPE: &str = "application/octet-stream";

/// User-metadata key carrying the source collection name
pub const META_SOURCE_STORE: &str = "source-store";
/// User-metadata key carrying the entry size as reported by the source
pub const META_SOURCE_SIZE: &str = "source-size";
/// User-metadata key carrying the entry modification time (RFC 3339)
pub const META_SOURCE_MODIFIED: &str = "source-modified";

/// One mutation observed on a watched collection.
///
/// Ephemeral: consumed once, never persisted. A `deleted` event is a
/// tombstone; `size` and `modified` then describe the entry's last live
/// revision as reported by the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entry name, unique within its collection. May contain `/`.
    pub name: String,
    /// Tombstone flag
    pub deleted: bool,
    /// Entry size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// One key discovered while enumerating the sink bucket
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
}

/// Sink key for a (collection, entry) pair.
///
/// Wire-visible format consumed by other tooling reading the bucket; must
/// stay bit-exact. `entry` is used verbatim, embedded separators included.
pub fn object_key(collection: &str, entry: &str) -> String {
    format!("{}/{}", collection, entry)
}

/// Listing prefix for a collection's sink keys
pub fn collection_prefix(collection: &str) -> String {
    format!("{}/", collection)
}

/// Inverse of [`object_key`]: strip the fixed-length collection prefix.
///
/// Returns `None` when the key does not belong to the collection.
pub fn entry_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

/// Provenance metadata recorded on every forward-synced sink object
pub fn provenance_metadata(collection: &str, event: &ChangeEvent) -> HashMap<String, String> {
    HashMap::from([
        (META_SOURCE_STORE.to_string(), collection.to_string()),
        (META_SOURCE_SIZE.to_string(), event.size.to_string()),
        (META_SOURCE_MODIFIED.to_string(), event.modified.to_rfc3339()),
    ])
}
