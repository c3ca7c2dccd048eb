//! Bounded retry for per-item operations, plus the dead-letter record for
//! items that still fail after the last attempt.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{BridgeError, Result};

/// Bounded exponential backoff applied to transient per-item failures.
///
/// Only isolates items; a retry exhausting its attempts still ends in
/// log-and-skip, never in a fatal error.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Run `op`, retrying transient failures with exponential backoff
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts.max(1) => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Record of items the bridge gave up on, for operator inspection
#[async_trait]
pub trait DeadLetter: Send + Sync {
    /// Record a permanently failed item. Must not fail the item further;
    /// recording problems are logged and swallowed.
    async fn record(&self, collection: &str, entry: &str, error: &BridgeError);
}

/// Discards everything
pub struct NoopDeadLetter;

#[async_trait]
impl DeadLetter for NoopDeadLetter {
    async fn record(&self, _collection: &str, _entry: &str, _error: &BridgeError) {}
}

#[derive(Serialize)]
struct DeadLetterLine<'a> {
    time: String,
    collection: &'a str,
    entry: &'a str,
    error: String,
}

/// Appends one JSON line per failed item
pub struct FsDeadLetter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FsDeadLetter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl DeadLetter for FsDeadLetter {
    async fn record(&self, collection: &str, entry: &str, error: &BridgeError) {
        let line = DeadLetterLine {
            time: Utc::now().to_rfc3339(),
            collection,
            entry,
            error: error.to_string(),
        };

        let result = (|| -> std::io::Result<()> {
            use std::io::Write;
            let _guard = self.lock.lock();
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let json = serde_json::to_string(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{}", json)
        })();

        if let Err(e) = result {
            tracing::warn!("failed to record dead letter for '{}': {}", entry, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = policy
            .run(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BridgeError::Sink("transient".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::Sink("still down".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::NotFound("gone".to_string()))
            })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fs_dead_letter_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead-letters.jsonl");
        let dl = FsDeadLetter::new(&path);

        dl.record("my-objects", "bad", &BridgeError::Sink("boom".to_string()))
            .await;
        dl.record("my-objects", "worse", &BridgeError::Source("nope".to_string()))
            .await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["entry"], "bad");
        assert_eq!(first["collection"], "my-objects");
    }
}
