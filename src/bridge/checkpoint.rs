//! Durable markers for resuming the change feed after a restart.
//!
//! The feed itself exposes no replayable offset at this layer, so the
//! marker is the modified time of the last successfully applied event per
//! collection. On startup, events at or before the marker are skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;

/// Swappable checkpoint persistence
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, collection: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record `marker` as the latest applied position. Markers never
    /// regress; a store call with an older marker is a no-op.
    async fn store(&self, collection: &str, marker: DateTime<Utc>) -> Result<()>;
}

/// Keeps nothing; every run starts live
pub struct NoopCheckpoints;

#[async_trait]
impl CheckpointStore for NoopCheckpoints {
    async fn load(&self, _collection: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn store(&self, _collection: &str, _marker: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// JSON file of per-collection markers, written atomically via tmp+rename
pub struct FsCheckpoints {
    path: PathBuf,
    state: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FsCheckpoints {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, snapshot: &HashMap<String, DateTime<Utc>>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpoints {
    async fn load(&self, collection: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().get(collection).copied())
    }

    async fn store(&self, collection: &str, marker: DateTime<Utc>) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            match state.get(collection) {
                Some(current) if *current >= marker => return Ok(()),
                _ => {}
            }
            state.insert(collection.to_string(), marker);
            state.clone()
        };
        self.persist(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[tokio::test]
    async fn fs_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let store = FsCheckpoints::open(&path).unwrap();
        store.store("my-objects", at(10)).await.unwrap();
        store.store("other", at(20)).await.unwrap();

        let reopened = FsCheckpoints::open(&path).unwrap();
        assert_eq!(reopened.load("my-objects").await.unwrap(), Some(at(10)));
        assert_eq!(reopened.load("other").await.unwrap(), Some(at(20)));
        assert_eq!(reopened.load("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn markers_never_regress() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpoints::open(dir.path().join("cp.json")).unwrap();

        store.store("c", at(30)).await.unwrap();
        store.store("c", at(5)).await.unwrap();
        assert_eq!(store.load("c").await.unwrap(), Some(at(30)));
    }
}
