//! Storage module
//!
//! The multipart-upload surface the uploader drives. [`crate::s3::S3Client`]
//! implements it against AWS S3; [`memory::MemoryStorage`] keeps everything
//! in process for tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStorage;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Request error: {0}")]
    Request(String),

    #[error("Response missing {0}")]
    MissingField(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Destination object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectTarget {
    pub bucket: String,
    pub key: String,
}

impl ObjectTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Server-side encryption directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    Aes256,
    AwsKms { key_id: Option<String> },
}

/// Options applied when the upload is created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub server_side_encryption: Option<Encryption>,
    pub content_type: Option<String>,
}

/// Identity of one uploaded part, required again at completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartRecord {
    pub part_number: i32,
    pub etag: String,
}

/// Result of committing an upload
#[derive(Debug, Clone, Default)]
pub struct CompletedUpload {
    pub location: Option<String>,
    pub etag: Option<String>,
}

/// Multipart upload operations of an object store.
///
/// Implementations do their own transport, auth and retries. Part numbers
/// start at 1.
#[async_trait]
pub trait MultipartStorage: Send + Sync {
    /// Start an upload and return its upload id
    async fn create_upload(
        &self,
        target: &ObjectTarget,
        options: &UploadOptions,
    ) -> Result<String, StorageError>;

    /// Upload one part of an open upload
    async fn upload_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartRecord, StorageError>;

    /// Commit the upload from its parts, in part-number order
    async fn complete_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedUpload, StorageError>;

    /// Discard the upload and everything uploaded to it
    async fn abort_upload(&self, target: &ObjectTarget, upload_id: &str)
        -> Result<(), StorageError>;
}
