//! S3-compatible backend for the sink side

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures::StreamExt;
use tokio::io::AsyncReadExt;

use super::{ByteStream, ObjectListing, SinkStore};
use crate::error::{BridgeError, Result};
use crate::types::ListedObject;

/// Minimum S3 part size is 5 MiB; 8 MiB keeps the part count down for
/// large blobs without holding much in memory.
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;

/// Read up to `limit` bytes from the stream. A short read means the
/// stream is exhausted.
async fn read_part(stream: &mut ByteStream, limit: usize) -> Result<Vec<u8>> {
    let mut part = Vec::with_capacity(limit.min(64 * 1024));
    let mut take = stream.take(limit as u64);
    take.read_to_end(&mut part).await?;
    Ok(part)
}

/// Sink store backed by an S3-compatible endpoint
pub struct S3SinkStore {
    client: S3Client,
}

impl S3SinkStore {
    /// Build a client against an explicit endpoint with static credentials
    pub async fn connect(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let credentials = Credentials::new(access_key, secret_key, None, None, "blobbridge");

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        // Path-style addressing keeps MinIO and friends working
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
        })
    }

    /// Wrap an already-configured client
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        mut rest: ByteStream,
    ) -> Result<()> {
        let mut completed = Vec::new();
        let mut part = first;
        loop {
            let last = part.len() < UPLOAD_PART_SIZE;
            let part_number = completed.len() as i32 + 1;
            let out = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(SdkByteStream::from(part))
                .send()
                .await
                .map_err(|e| BridgeError::Sink(e.to_string()))?;
            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(out.e_tag().map(str::to_string))
                    .build(),
            );
            if last {
                break;
            }
            part = read_part(&mut rest, UPLOAD_PART_SIZE).await?;
            if part.is_empty() {
                // exact multiple of the part size, nothing left to send
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BridgeError::Sink(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SinkStore for S3SinkStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(BridgeError::Sink(service_error.to_string()))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| BridgeError::Sink(e.to_string()))?;
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut content: ByteStream,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        // The source never tells us the length up front, so peek one part:
        // a short first read is a small object and goes up in one request,
        // anything larger streams part by part through a multipart upload.
        let first = read_part(&mut content, UPLOAD_PART_SIZE).await?;
        if first.len() < UPLOAD_PART_SIZE {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .set_metadata(Some(metadata))
                .body(SdkByteStream::from(first))
                .send()
                .await
                .map_err(|e| BridgeError::Sink(e.to_string()))?;
            return Ok(());
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| BridgeError::Sink(e.to_string()))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| BridgeError::Sink("multipart upload without an id".to_string()))?
            .to_string();

        match self
            .upload_parts(bucket, key, &upload_id, first, content)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leftover parts are billable storage; aborting is best effort
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key, "failed to abort multipart upload: {}", abort);
                }
                Err(e)
            }
        }
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        // S3 itself reports deleting a missing key as success; some
        // compatible stores return NoSuchKey instead
        match self.client.delete_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("NoSuchKey") {
                    Err(BridgeError::NotFound(key.to_string()))
                } else {
                    Err(BridgeError::Sink(msg))
                }
            }
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<ObjectListing> {
        let paginator = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let listing = futures::stream::unfold(paginator, |mut paginator| async move {
            match paginator.next().await {
                Some(Ok(page)) => {
                    let objects: Vec<Result<ListedObject>> = page
                        .contents()
                        .iter()
                        .map(|o| {
                            Ok(ListedObject {
                                key: o.key().unwrap_or_default().to_string(),
                                size: o.size().unwrap_or_default() as u64,
                            })
                        })
                        .collect();
                    Some((futures::stream::iter(objects), paginator))
                }
                Some(Err(e)) => {
                    let err = vec![Err(BridgeError::Listing(e.to_string()))];
                    Some((futures::stream::iter(err), paginator))
                }
                None => None,
            }
        })
        .flatten();

        Ok(Box::pin(listing))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    BridgeError::NotFound(key.to_string())
                } else {
                    BridgeError::Sink(service_error.to_string())
                }
            })?;

        Ok(Box::new(response.body.into_async_read()))
    }
}
