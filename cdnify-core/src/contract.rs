//! # contract: collaborator interfaces of the publish pipeline
//!
//! This module defines the two seams the pipeline talks through:
//!
//! - [`ObjectStore`]: the remote object store the publisher writes to. The
//!   production implementation is [`crate::s3::S3Client`]; tests use the
//!   generated `MockObjectStore`.
//! - [`Bundler`]: the external collaborator that flattens a multi-file HTML
//!   import graph into one document. [`crate::bundle::CommandBundler`] runs an
//!   external executable; tests use `MockBundler`.
//!
//! ## Mocking & Testing
//! Both traits are annotated for `mockall`. The mocks are exported under the
//! `test-export-mocks` feature (on by default) so integration tests and
//! downstream crates can build deterministic doubles.
//!
//! ## Error Contract
//! Store methods return [`StoreError`]; only transient variants are retried by
//! the publisher (see [`StoreError::is_transient`]).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// Bucket and key of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// Headers written with every stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub cache_control: String,
    pub content_type: String,
}

/// A single-request upload.
#[derive(Debug, Clone)]
pub struct PutObject {
    pub location: ObjectLocation,
    pub headers: ObjectHeaders,
    pub body: Vec<u8>,
}

/// One part of a multipart upload. Part numbers start at 1.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub location: ObjectLocation,
    pub upload_id: String,
    pub part_number: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The request never produced a response (connect, TLS, timeout, reset).
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// A response arrived but could not be understood.
    #[error("unexpected response from remote store: {0}")]
    Protocol(String),
    #[error("local i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer cancelled before dispatch")]
    Cancelled,
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            StoreError::Protocol(_) | StoreError::Io(_) | StoreError::Cancelled => false,
        }
    }
}

/// The remote object store beneath the publisher.
///
/// Implementations only perform single requests; retry, fan-out and
/// accumulation are the publisher's job.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every key under `prefix` in `bucket`, across all result pages.
    async fn list_keys(&self, bucket: String, prefix: String) -> Result<Vec<String>, StoreError>;

    async fn put_object(&self, request: PutObject) -> Result<(), StoreError>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart_upload(
        &self,
        location: ObjectLocation,
        headers: ObjectHeaders,
    ) -> Result<String, StoreError>;

    async fn upload_part(&self, request: UploadPart) -> Result<CompletedPart, StoreError>;

    async fn complete_multipart_upload(
        &self,
        location: ObjectLocation,
        upload_id: String,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError>;

    async fn abort_multipart_upload(
        &self,
        location: ObjectLocation,
        upload_id: String,
    ) -> Result<(), StoreError>;

    async fn delete_object(&self, location: ObjectLocation) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle entry {0} does not exist")]
    MissingEntry(PathBuf),
    #[error("failed to launch bundler {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bundler exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("bundler produced invalid output: {0}")]
    InvalidOutput(String),
}

/// Flattens an HTML import graph rooted at `entry` into one document.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Bundler: Send + Sync {
    fn bundle(&self, entry: &Path) -> Result<String, BundleError>;
}
