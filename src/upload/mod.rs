//! Upload module
//!
//! Streams a reader into object storage: a [`chunker::Chunker`] splits the
//! bytes on a background task and a [`multipart::MultipartUploader`] pushes
//! the chunks as parts of one multipart upload.

use crate::process::ProcessError;
use crate::storage::{MultipartStorage, ObjectTarget, StorageError, UploadOptions};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod chunker;
pub mod multipart;

pub use chunker::{Chunk, ChunkMessage, ChunkStream, Chunker};
pub use multipart::{MultipartUploader, SessionState, UploadSession, UploadSummary};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Command failed: {0}")]
    Process(#[source] ProcessError),

    #[error("Failed to read command output: {0}")]
    StreamRead(#[source] io::Error),

    #[error("Failed to create multipart upload: {0}")]
    Create(#[source] StorageError),

    #[error("Failed to upload part {part_number}: {source}")]
    UploadPart {
        part_number: i32,
        #[source]
        source: StorageError,
    },

    #[error("Failed to complete multipart upload: {0}")]
    Complete(#[source] StorageError),

    #[error("Too many parts (maximum {max}); increase the part size")]
    TooManyParts { max: i32 },

    #[error("Chunker stopped unexpectedly")]
    ChunkerStopped,

    #[error("Upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Classify an error read from the source stream
    pub fn from_read_error(err: io::Error) -> Self {
        match ProcessError::from_io(&err) {
            Some(ProcessError::Cancelled) => UploadError::Cancelled,
            Some(process) => UploadError::Process(process.clone()),
            None => UploadError::StreamRead(err),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Process(_) => "process",
            UploadError::StreamRead(_) => "stream_read",
            UploadError::Create(_) => "create",
            UploadError::UploadPart { .. } => "upload_part",
            UploadError::Complete(_) => "complete",
            UploadError::TooManyParts { .. } => "too_many_parts",
            UploadError::ChunkerStopped => "chunker_stopped",
            UploadError::Cancelled => "cancelled",
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub part_size: usize,
    pub queue_depth: usize,
    pub options: UploadOptions,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            part_size: multipart::DEFAULT_PART_SIZE,
            queue_depth: chunker::DEFAULT_QUEUE_DEPTH,
            options: UploadOptions::default(),
        }
    }
}

/// Upload everything `reader` produces to `target`.
///
/// Either the object is committed and a summary returned, or the upload is
/// aborted and the error that caused it returned.
#[tracing::instrument(
    name = "upload.stream",
    skip(reader, storage, settings, cancel),
    fields(
        s3.bucket = %target.bucket,
        s3.key = %target.key,
        upload.part_size = settings.part_size
    ),
    err
)]
pub async fn stream_to_storage<R>(
    reader: R,
    storage: Arc<dyn MultipartStorage>,
    target: &ObjectTarget,
    settings: &UploadSettings,
    cancel: &CancellationToken,
) -> Result<UploadSummary, UploadError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let chunks =
        Chunker::new(settings.part_size, settings.queue_depth).spawn(reader, cancel.clone());
    let uploader = MultipartUploader::new(storage, settings.options.clone());
    uploader.upload(target, chunks, cancel).await
}
