//! Process configuration: CLI arguments with environment fallbacks

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{BridgeError, Result};

/// Which replication direction this invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Watch the source collection(s) and mirror changes into the sink
    /// bucket until stopped
    Watch,
    /// One-shot: rebuild the source collection(s) from the sink bucket,
    /// then exit
    Restore,
}

#[derive(Parser, Debug)]
#[command(name = "blobbridge")]
#[command(about = "Replication bridge between a NATS object store and an S3-compatible bucket")]
#[command(version)]
pub struct Args {
    /// Run mode
    #[arg(value_enum, default_value = "watch")]
    pub mode: Mode,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// S3-compatible endpoint (e.g. https://s3.wasabisys.com)
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: String,

    /// S3 region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// S3 access key
    #[arg(long, env = "S3_ACCESS_KEY")]
    pub s3_access_key: String,

    /// S3 secret key
    #[arg(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: String,

    /// Sink bucket name
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: String,

    /// Collection(s) to replicate; repeat the flag or comma-separate
    #[arg(
        long = "collection",
        env = "BRIDGE_COLLECTIONS",
        value_delimiter = ',',
        default_value = "my-objects"
    )]
    pub collections: Vec<String>,

    /// Worker shards for the forward event loop (1 = strictly sequential)
    #[arg(long, env = "BRIDGE_SHARDS", default_value_t = 1)]
    pub shards: usize,

    /// Attempts per item operation before it is dropped
    #[arg(long, env = "BRIDGE_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Base backoff delay between attempts, in milliseconds
    #[arg(long, env = "BRIDGE_RETRY_DELAY_MS", default_value_t = 200)]
    pub retry_delay_ms: u64,

    /// Checkpoint file for feed resumption; omit to start live every run
    #[arg(long, env = "BRIDGE_CHECKPOINT_PATH")]
    pub checkpoint_path: Option<PathBuf>,

    /// Dead-letter file for items dropped after retry exhaustion
    #[arg(long, env = "BRIDGE_DEAD_LETTER_PATH")]
    pub dead_letter_path: Option<PathBuf>,
}

impl Args {
    /// Reject empty values before any connection is attempted. Clap
    /// guarantees presence, but env vars can still supply empty strings.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("NATS URL", &self.nats_url),
            ("S3 endpoint", &self.s3_endpoint),
            ("S3 access key", &self.s3_access_key),
            ("S3 secret key", &self.s3_secret_key),
            ("S3 bucket", &self.s3_bucket),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{} must not be empty", what)));
            }
        }
        if self.collections.is_empty() || self.collections.iter().any(|c| c.trim().is_empty()) {
            return Err(BridgeError::Config(
                "at least one non-empty collection name is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn base_args() -> Vec<&'static str> {
        vec![
            "blobbridge",
            "--s3-endpoint",
            "http://localhost:9000",
            "--s3-access-key",
            "minio",
            "--s3-secret-key",
            "minio123",
            "--s3-bucket",
            "backups",
        ]
    }

    #[test]
    fn defaults_to_watch_mode() {
        let args = Args::parse_from(base_args());
        assert_eq!(args.mode, Mode::Watch);
        assert_eq!(args.collections, vec!["my-objects"]);
        assert_eq!(args.shards, 1);
        args.validate().unwrap();
    }

    #[test]
    fn restore_mode_is_positional() {
        let mut argv = base_args();
        argv.insert(1, "restore");
        let args = Args::parse_from(argv);
        assert_eq!(args.mode, Mode::Restore);
    }

    #[test]
    fn collections_split_on_commas() {
        let mut argv = base_args();
        argv.extend(["--collection", "alpha,beta"]);
        let args = Args::parse_from(argv);
        assert_eq!(args.collections, vec!["alpha", "beta"]);
    }

    #[test]
    fn empty_bucket_rejected() {
        let mut argv = base_args();
        let pos = argv.iter().position(|a| *a == "backups").unwrap();
        argv[pos] = "  ";
        let args = Args::parse_from(argv);
        assert!(args.validate().is_err());
    }
}
