//! Blobbridge daemon
//!
//! Run with: blobbridge [watch|restore]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blobbridge::bridge::{
    CheckpointStore, DeadLetter, FsCheckpoints, FsDeadLetter, NoopCheckpoints, NoopDeadLetter,
    RetryPolicy,
};
use blobbridge::config::{Args, Mode};
use blobbridge::{Bridge, Credentials, Replicator, Restorer};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    args.validate()?;

    let credentials = Credentials {
        access_key: args.s3_access_key.clone(),
        secret_key: args.s3_secret_key.clone(),
    };
    let bridge = Arc::new(
        Bridge::connect(
            &args.nats_url,
            &args.s3_endpoint,
            &args.s3_region,
            &credentials,
            &args.s3_bucket,
        )
        .await?,
    );

    let retry = RetryPolicy::new(
        args.retry_attempts,
        Duration::from_millis(args.retry_delay_ms),
    );
    let dead_letter: Arc<dyn DeadLetter> = match &args.dead_letter_path {
        Some(path) => Arc::new(FsDeadLetter::new(path)),
        None => Arc::new(NoopDeadLetter),
    };

    match args.mode {
        Mode::Restore => {
            let restorer = Restorer::new(bridge)
                .with_retry(retry)
                .with_dead_letter(dead_letter);
            for collection in &args.collections {
                let processed = restorer.restore(collection).await?;
                tracing::info!(collection = %collection, processed, "restore complete");
            }
            Ok(())
        }
        Mode::Watch => {
            let checkpoints: Arc<dyn CheckpointStore> = match &args.checkpoint_path {
                Some(path) => Arc::new(FsCheckpoints::open(path)?),
                None => Arc::new(NoopCheckpoints),
            };

            let mut tasks = JoinSet::new();
            for collection in args.collections.clone() {
                let replicator = Replicator::new(bridge.clone())
                    .with_retry(retry)
                    .with_shards(args.shards)
                    .with_checkpoints(checkpoints.clone())
                    .with_dead_letter(dead_letter.clone());
                tasks.spawn(async move {
                    replicator
                        .run(&collection)
                        .await
                        .map(|_| collection.clone())
                });
            }

            // the first replicator to fail (or finish) takes the process
            // down; collections are independent but the run is not
            while let Some(joined) = tasks.join_next().await {
                let finished = joined??;
                tracing::warn!(collection = %finished, "replicator stopped");
            }
            Ok(())
        }
    }
}
