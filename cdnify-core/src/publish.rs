//! Publisher: tree-syncs a staging directory to a versioned key prefix.
//!
//! # Protocol
//! - Every file under the staging directory is uploaded to
//!   `[namespace/]name/version/<relative path>` with the configured cache
//!   directive.
//! - Remote keys under the prefix without a local counterpart are deleted.
//! - Each request is retried a bounded number of times with a fixed delay when
//!   the failure is transient. A file that still fails is recorded and its
//!   siblings carry on.
//! - Files at or above the multipart threshold are uploaded in parts; each part
//!   is retried on its own.
//! - At most `max_in_flight` requests are outstanding at any moment, across
//!   files, parts and deletions.
//!
//! # Result
//! One [`PublishResult`] per call, folded from all transfer outcomes at a single
//! accumulation point. The staging directory is removed only when every
//! transfer succeeded and the caller did not ask to keep it.

use futures::future::Future;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::PublishTuning;
use crate::contract::{
    CompletedPart, ObjectHeaders, ObjectLocation, ObjectStore, PutObject, StoreError, UploadPart,
};
use crate::discover::{slash_path, WalkFiles};

/// Where one publish lands in the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub namespace: Option<String>,
    pub name: String,
    pub version: String,
    pub bucket: String,
}

impl PublishTarget {
    /// `[namespace/]name/version/`
    pub fn key_prefix(&self) -> String {
        match self
            .namespace
            .as_deref()
            .map(|ns| ns.trim_matches('/'))
            .filter(|ns| !ns.is_empty())
        {
            Some(ns) => format!("{ns}/{}/{}/", self.name, self.version),
            None => format!("{}/{}/", self.name, self.version),
        }
    }

    pub fn key_for(&self, relative: &Path) -> String {
        format!("{}{}", self.key_prefix(), slash_path(relative))
    }
}

#[derive(Debug)]
pub struct PublishFailure {
    /// Staged relative path, or remote key for deletions and listing.
    pub path: String,
    pub cause: StoreError,
}

#[derive(Debug, Default)]
pub struct PublishResult {
    /// Local files found in the staging directory.
    pub total: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub failures: Vec<PublishFailure>,
    pub staging_removed: bool,
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_success() {
            format!(
                "all {} files uploaded, {} stale objects deleted",
                self.uploaded, self.deleted
            )
        } else {
            format!(
                "{} of {} files uploaded, {} failures",
                self.uploaded,
                self.total,
                self.failures.len()
            )
        }
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Uploaded => self.uploaded += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

/// Stops dispatch of queued transfers. Objects already written stay written.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Keep the staging directory even after a fully successful publish.
    pub preserve_staging: bool,
    pub cancel: Option<CancelHandle>,
}

enum Job {
    Upload(PathBuf),
    Delete(String),
}

enum Outcome {
    Uploaded,
    Deleted,
    Failed(PublishFailure),
}

/// Guesses a `Content-Type` from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "txt" | "md" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

struct Transfer<'a, S: ?Sized> {
    store: &'a S,
    tuning: &'a PublishTuning,
    target: &'a PublishTarget,
    staging_dir: &'a Path,
    permits: Semaphore,
    cancel: Option<&'a CancelHandle>,
}

impl<'a, S: ObjectStore + ?Sized> Transfer<'a, S> {
    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelHandle::is_cancelled)
    }

    /// Runs one request under a permit, retrying transient failures.
    async fn attempt<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| StoreError::Transport(format!("transfer pool closed: {e}")))?;
                op().await
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.tuning.retry_count => {
                    attempt += 1;
                    warn!(
                        what,
                        attempt,
                        max = self.tuning.retry_count,
                        error = %e,
                        "[PUBLISH] Transient failure, retrying"
                    );
                    tokio::time::sleep(self.tuning.retry_delay).await;
                }
                Err(e) => {
                    error!(what, attempts = attempt + 1, error = %e, "[PUBLISH] Request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn run(&self, job: Job) -> Outcome {
        match job {
            Job::Upload(relative) => {
                let path = slash_path(&relative);
                match self.upload(&relative).await {
                    Ok(()) => Outcome::Uploaded,
                    Err(cause) => Outcome::Failed(PublishFailure { path, cause }),
                }
            }
            Job::Delete(key) => {
                if self.cancelled() {
                    return Outcome::Failed(PublishFailure {
                        path: key,
                        cause: StoreError::Cancelled,
                    });
                }
                let location = ObjectLocation::new(&self.target.bucket, &key);
                match self
                    .attempt(&key, || self.store.delete_object(location.clone()))
                    .await
                {
                    Ok(()) => {
                        debug!(key = %key, "[PUBLISH] Deleted stale object");
                        Outcome::Deleted
                    }
                    Err(cause) => Outcome::Failed(PublishFailure { path: key, cause }),
                }
            }
        }
    }

    async fn upload(&self, relative: &Path) -> Result<(), StoreError> {
        if self.cancelled() {
            return Err(StoreError::Cancelled);
        }
        let body = tokio::fs::read(self.staging_dir.join(relative)).await?;
        let location = ObjectLocation::new(&self.target.bucket, self.target.key_for(relative));
        let headers = ObjectHeaders {
            cache_control: self.tuning.cache_control.clone(),
            content_type: content_type_for(relative).to_string(),
        };

        if !body.is_empty() && body.len() as u64 >= self.tuning.multipart_threshold {
            return self.upload_multipart(location, headers, body).await;
        }

        let request = PutObject {
            location,
            headers,
            body,
        };
        self.attempt(&request.location.key, || self.store.put_object(request.clone()))
            .await?;
        debug!(key = %request.location.key, "[PUBLISH] Uploaded object");
        Ok(())
    }

    async fn upload_multipart(
        &self,
        location: ObjectLocation,
        headers: ObjectHeaders,
        body: Vec<u8>,
    ) -> Result<(), StoreError> {
        let key = location.key.clone();
        let upload_id = self
            .attempt(&key, || {
                self.store
                    .create_multipart_upload(location.clone(), headers.clone())
            })
            .await?;

        let part_size = self.tuning.multipart_part_size.max(1) as usize;
        let parts: Vec<Result<CompletedPart, StoreError>> = stream::iter(
            body.chunks(part_size).enumerate(),
        )
        .map(|(index, chunk)| {
            let request = UploadPart {
                location: location.clone(),
                upload_id: upload_id.clone(),
                part_number: index as u32 + 1,
                body: chunk.to_vec(),
            };
            let key = &key;
            async move {
                self.attempt(key, || self.store.upload_part(request.clone()))
                    .await
            }
        })
        .buffer_unordered(self.tuning.max_in_flight.max(1))
        .collect()
        .await;

        let mut completed = Vec::with_capacity(parts.len());
        let mut first_error = None;
        for part in parts {
            match part {
                Ok(p) => completed.push(p),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            if let Err(abort) = self
                .store
                .abort_multipart_upload(location.clone(), upload_id.clone())
                .await
            {
                warn!(key = %key, error = %abort, "[PUBLISH] Failed to abort multipart upload");
            }
            return Err(e);
        }

        completed.sort_by_key(|p| p.part_number);
        let part_count = completed.len();
        self.attempt(&key, || {
            self.store
                .complete_multipart_upload(location.clone(), upload_id.clone(), completed.clone())
        })
        .await?;
        debug!(key = %key, parts = part_count, "[PUBLISH] Completed multipart upload");
        Ok(())
    }
}

/// Publishes `staging_dir` to `target`. Always returns one terminal result.
pub async fn publish<S>(
    store: &S,
    tuning: &PublishTuning,
    target: &PublishTarget,
    staging_dir: &Path,
    options: &PublishOptions,
) -> PublishResult
where
    S: ObjectStore + ?Sized,
{
    let prefix = target.key_prefix();
    info!(bucket = %target.bucket, prefix = %prefix, staging = %staging_dir.display(), "[PUBLISH] Starting publish");

    let mut result = PublishResult::default();
    let mut local = Vec::new();
    for item in WalkFiles::new(staging_dir) {
        match item {
            Ok(relative) => local.push(relative),
            Err(e) => result.failures.push(PublishFailure {
                path: staging_dir.display().to_string(),
                cause: StoreError::Io(e),
            }),
        }
    }
    result.total = local.len();
    let local_keys: BTreeSet<String> = local.iter().map(|r| target.key_for(r)).collect();

    let transfer = Transfer {
        store,
        tuning,
        target,
        staging_dir,
        permits: Semaphore::new(tuning.max_in_flight.max(1)),
        cancel: options.cancel.as_ref(),
    };

    let mut jobs: Vec<Job> = local.into_iter().map(Job::Upload).collect();
    match transfer
        .attempt(&prefix, || {
            store.list_keys(target.bucket.clone(), prefix.clone())
        })
        .await
    {
        Ok(remote) => {
            let stale: Vec<String> = remote
                .into_iter()
                .filter(|key| key.starts_with(&prefix) && !local_keys.contains(key))
                .collect();
            info!(stale = stale.len(), "[PUBLISH] Remote objects scheduled for deletion");
            jobs.extend(stale.into_iter().map(Job::Delete));
        }
        Err(cause) => {
            // Without a listing the prefix cannot be synced; keep uploading regardless.
            error!(prefix = %prefix, error = %cause, "[PUBLISH] Could not list remote prefix");
            result.failures.push(PublishFailure {
                path: prefix.clone(),
                cause,
            });
        }
    }

    let transfer = &transfer;
    let mut result = stream::iter(jobs)
        .map(|job| transfer.run(job))
        .buffer_unordered(tuning.max_in_flight.max(1))
        .fold(result, |mut acc, outcome| async move {
            acc.record(outcome);
            acc
        })
        .await;

    if result.is_success() {
        info!(
            uploaded = result.uploaded,
            deleted = result.deleted,
            prefix = %prefix,
            "[PUBLISH] Publish complete"
        );
        if !options.preserve_staging {
            match tokio::fs::remove_dir_all(staging_dir).await {
                Ok(()) => result.staging_removed = true,
                Err(e) => {
                    warn!(error = %e, staging = %staging_dir.display(), "[PUBLISH] Could not remove staging directory")
                }
            }
        }
    } else {
        error!(
            uploaded = result.uploaded,
            total = result.total,
            failures = result.failures.len(),
            staging = %staging_dir.display(),
            "[PUBLISH] Publish incomplete; staging directory preserved"
        );
    }
    result
}
