/*
 * Copyright 2025 Oxide Computer Company
 */

use std::future::Future;
use std::path::Path;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use gantry_common::guess_mime_type;
use gantry_types::{RunError, StagingPlan};
use slog::{debug, info, Logger};

/**
 * The narrow object storage boundary the staging gateway is written
 * against.  Implementations accept a pre-opened client session; no listing
 * is ever cached across calls, because another writer may be active in the
 * same bucket.
 */
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /**
     * Every key in the bucket that starts with the given prefix.
     */
    fn list(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /**
     * Delete one object, reporting whether it existed.  Backends that
     * cannot tell report true.
     */
    fn delete(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<bool>> + Send;
}

fn staging_error(
    bucket: &str,
    key: &str,
    source: anyhow::Error,
) -> RunError {
    RunError::Staging {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    }
}

/**
 * Upload each named input file from the local input root to the run's
 * working prefix, and establish the working directory (and, if requested,
 * the output directory) as listable prefixes with zero-byte markers.  Any
 * single failed transfer fails the whole upload; nothing is rolled back,
 * because the recovery path is a re-run under a fresh prefix.
 */
pub async fn upload_inputs<S: ObjectStore>(
    log: &Logger,
    store: &S,
    plan: &StagingPlan,
    input_root: &Path,
    files: &[String],
    create_output_marker: bool,
) -> Result<(), RunError> {
    let marker = plan.marker_key();
    store
        .put(&plan.bucket, &marker, Bytes::new())
        .await
        .map_err(|e| staging_error(&plan.bucket, &marker, e))?;

    for relpath in files {
        let key = plan.object_key(relpath);

        let data = tokio::fs::read(input_root.join(relpath))
            .await
            .map_err(|e| {
                staging_error(
                    &plan.bucket,
                    &key,
                    anyhow!("reading local file {relpath:?}: {e}"),
                )
            })?;

        let len = data.len();
        store
            .put(&plan.bucket, &key, Bytes::from(data))
            .await
            .map_err(|e| staging_error(&plan.bucket, &key, e))?;

        info!(log, "uploaded input {relpath:?} to {}:{key}", plan.bucket;
            "bytes" => len);
    }

    if create_output_marker {
        if let Some(op) = plan.output_prefix() {
            let marker = format!("{}/", op);
            store
                .put(&plan.bucket, &marker, Bytes::new())
                .await
                .map_err(|e| staging_error(&plan.bucket, &marker, e))?;
        }
    }

    Ok(())
}

/**
 * Download each explicitly named output file from the working prefix, and
 * in output directory mode harvest everything under the output prefix
 * (skipping directory markers) into the local output root.  Files already
 * downloaded are not removed when a later transfer fails.
 */
pub async fn download_outputs<S: ObjectStore>(
    log: &Logger,
    store: &S,
    plan: &StagingPlan,
    output_root: &Path,
    files: &[String],
    output_dir_enabled: bool,
) -> Result<(), RunError> {
    for relpath in files {
        let key = plan.object_key(relpath);
        fetch_to(log, store, &plan.bucket, &key, output_root, relpath)
            .await?;
    }

    if output_dir_enabled {
        if let Some(op) = plan.output_prefix() {
            let keys = store
                .list(&plan.bucket, &format!("{}/", op))
                .await
                .map_err(|e| staging_error(&plan.bucket, &op, e))?;

            for key in keys {
                if key.ends_with('/') {
                    /*
                     * Directory markers are not files.
                     */
                    continue;
                }

                let relpath = key
                    .strip_prefix(&format!("{}/", op))
                    .ok_or_else(|| {
                        staging_error(
                            &plan.bucket,
                            &key,
                            anyhow!("listed key outside output prefix"),
                        )
                    })?
                    .to_string();

                fetch_to(log, store, &plan.bucket, &key, output_root, &relpath)
                    .await?;
            }
        }
    }

    Ok(())
}

async fn fetch_to<S: ObjectStore>(
    log: &Logger,
    store: &S,
    bucket: &str,
    key: &str,
    output_root: &Path,
    relpath: &str,
) -> Result<(), RunError> {
    let data = store
        .get(bucket, key)
        .await
        .map_err(|e| staging_error(bucket, key, e))?;

    let target = output_root.join(relpath);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            staging_error(
                bucket,
                key,
                anyhow!("creating {parent:?}: {e}"),
            )
        })?;
    }

    let len = data.len();
    tokio::fs::write(&target, &data).await.map_err(|e| {
        staging_error(bucket, key, anyhow!("writing {target:?}: {e}"))
    })?;

    info!(log, "downloaded output {}:{key} to {target:?}", bucket;
        "bytes" => len);

    Ok(())
}

/**
 * Delete everything under the given prefix, then the marker object for the
 * prefix itself.  Deleting a prefix that does not exist, or one that was
 * already deleted, is a no-op rather than an error.
 */
pub async fn delete_prefix<S: ObjectStore>(
    log: &Logger,
    store: &S,
    bucket: &str,
    prefix: &str,
) -> Result<(), RunError> {
    let marker = format!("{}/", prefix.trim_end_matches('/'));

    let keys = store
        .list(bucket, &marker)
        .await
        .map_err(|e| staging_error(bucket, prefix, e))?;

    let mut removed = 0;
    for key in keys {
        if key == marker {
            /*
             * The marker goes last, once the prefix is otherwise empty.
             */
            continue;
        }

        if store
            .delete(bucket, &key)
            .await
            .map_err(|e| staging_error(bucket, &key, e))?
        {
            removed += 1;
        }
    }

    store
        .delete(bucket, &marker)
        .await
        .map_err(|e| staging_error(bucket, &marker, e))?;

    debug!(log, "deleted staged objects under {}:{marker}", bucket;
        "removed" => removed);

    Ok(())
}

/**
 * Object storage over S3.  The client session is owned by the caller and
 * may be shared with other gateways for the duration of a run.
 */
pub struct S3Store {
    s3: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(s3: aws_sdk_s3::Client) -> S3Store {
        S3Store { s3 }
    }
}

impl ObjectStore for S3Store {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(guess_mime_type(key))
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await?;

        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let obj =
            self.s3.get_object().bucket(bucket).key(key).send().await?;

        Ok(obj.body.collect().await?.into_bytes())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut req =
                self.s3.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }

            let res = req.send().await?;

            for obj in res.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if res.is_truncated() == Some(true) {
                token = res.next_continuation_token().map(str::to_string);
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        self.s3.delete_object().bucket(bucket).key(key).send().await?;

        /*
         * S3 does not report whether the object existed.
         */
        Ok(true)
    }
}
