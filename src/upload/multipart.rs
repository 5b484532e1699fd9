//! Multipart upload handler
//!
//! Drives one multipart upload from a [`ChunkStream`]: create the upload,
//! send each chunk as the next part, then complete with the recorded part
//! list. Any failure after the upload was created aborts it, so the object
//! is either committed whole or never appears.

use super::chunker::{ChunkMessage, ChunkStream};
use super::UploadError;
use crate::metrics;
use crate::storage::{MultipartStorage, ObjectTarget, PartRecord, UploadOptions};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum part size (5MB) - S3 requirement for all parts but the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum part size (5GB) - S3 limit
pub const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Default part size (100MB)
pub const DEFAULT_PART_SIZE: usize = 100 * 1024 * 1024;

/// Maximum parts allowed
pub const MAX_PARTS: i32 = 10000;

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Completed,
    Aborted,
}

/// An upload created on the storage service
#[derive(Debug)]
pub struct UploadSession {
    pub target: ObjectTarget,
    pub upload_id: String,
    state: SessionState,
}

impl UploadSession {
    fn open(target: ObjectTarget, upload_id: String) -> Self {
        Self {
            target,
            upload_id,
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move an open session to a terminal state. Returns false if the
    /// session already ended.
    fn finish(&mut self, state: SessionState) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        self.state = state;
        true
    }
}

/// Outcome of a committed upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub location: Option<String>,
    pub etag: Option<String>,
    pub parts: usize,
    pub bytes: u64,
}

/// Multipart upload handler
pub struct MultipartUploader {
    storage: Arc<dyn MultipartStorage>,
    options: UploadOptions,
}

impl MultipartUploader {
    /// Create a new multipart handler
    pub fn new(storage: Arc<dyn MultipartStorage>, options: UploadOptions) -> Self {
        Self { storage, options }
    }

    /// Upload every chunk of `chunks` as one object.
    ///
    /// Parts are sent one at a time, in stream order. On failure or
    /// cancellation the upload is aborted and the original error returned;
    /// a failing abort is only logged.
    pub async fn upload(
        &self,
        target: &ObjectTarget,
        mut chunks: ChunkStream,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary, UploadError> {
        let start_time = Instant::now();

        let mut session = match self.create(target, cancel).await {
            Ok(session) => session,
            Err(e) => {
                metrics::record_error(e.kind());
                return Err(e);
            }
        };

        let uploaded = self.upload_parts(&session, &mut chunks, cancel).await;
        // Stops the chunker, and with it the source, before talking to S3 again
        drop(chunks);

        let result = match uploaded {
            Ok((parts, bytes)) => self.complete(&mut session, parts, bytes, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(summary) => {
                metrics::record_upload_completed();
                tracing::info!(
                    upload_id = %summary.upload_id,
                    parts = summary.parts,
                    bytes = summary.bytes,
                    duration_ms = start_time.elapsed().as_millis(),
                    "Multipart upload completed"
                );
                Ok(summary)
            }
            Err(e) => {
                metrics::record_error(e.kind());
                self.abort(&mut session, &e).await;
                Err(e)
            }
        }
    }

    /// Initiate a multipart upload
    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(self, cancel),
        fields(
            s3.bucket = %target.bucket,
            s3.key = %target.key
        ),
        err
    )]
    async fn create(
        &self,
        target: &ObjectTarget,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        let upload_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = self.storage.create_upload(target, &self.options) => {
                result.map_err(UploadError::Create)?
            }
        };

        tracing::info!(upload_id = %upload_id, "Created multipart upload");

        Ok(UploadSession::open(target.clone(), upload_id))
    }

    /// Consume the chunk stream, uploading each chunk as the next part.
    ///
    /// Returns the part records in part-number order and the byte total.
    async fn upload_parts(
        &self,
        session: &UploadSession,
        chunks: &mut ChunkStream,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PartRecord>, u64), UploadError> {
        let mut parts: Vec<PartRecord> = Vec::new();
        let mut bytes = 0u64;

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                message = chunks.recv() => message,
            };

            match message {
                Some(ChunkMessage::Chunk(chunk)) => {
                    debug_assert_eq!(chunk.index, parts.len() as u64);
                    debug_assert_eq!(chunk.offset, bytes);

                    let part_number = parts.len() as i32 + 1;
                    if part_number > MAX_PARTS {
                        return Err(UploadError::TooManyParts { max: MAX_PARTS });
                    }

                    bytes += chunk.len() as u64;
                    let record = self
                        .upload_part(session, part_number, chunk.data, cancel)
                        .await?;
                    parts.push(record);
                }
                Some(ChunkMessage::Error(e)) => return Err(UploadError::from_read_error(e)),
                Some(ChunkMessage::End) => break,
                None => return Err(UploadError::ChunkerStopped),
            }
        }

        if parts.is_empty() {
            // S3 needs at least one part to complete; an empty part makes an empty object
            let record = self.upload_part(session, 1, Bytes::new(), cancel).await?;
            parts.push(record);
        }

        Ok((parts, bytes))
    }

    /// Upload a part
    #[tracing::instrument(
        name = "upload.multipart.upload_part",
        skip(self, session, body, cancel),
        fields(
            upload_id = %session.upload_id,
            part_number = part_number,
            upload.bytes = body.len()
        ),
        err
    )]
    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<PartRecord, UploadError> {
        let size = body.len();
        let start_time = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = self.storage.upload_part(
                &session.target,
                &session.upload_id,
                part_number,
                body,
            ) => result,
        };
        let record = result.map_err(|source| UploadError::UploadPart {
            part_number,
            source,
        })?;

        metrics::record_part(size, start_time.elapsed().as_secs_f64());
        tracing::debug!(
            part_number = part_number,
            size = size,
            etag = %record.etag,
            "Uploaded part"
        );

        Ok(record)
    }

    /// Complete a multipart upload
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self, session, parts, cancel),
        fields(
            upload_id = %session.upload_id,
            parts_count = parts.len()
        ),
        err
    )]
    async fn complete(
        &self,
        session: &mut UploadSession,
        parts: Vec<PartRecord>,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadSummary, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // Not raced against `cancel`: a commit the service applied is reported as completed
        let completed = self
            .storage
            .complete_upload(&session.target, &session.upload_id, &parts)
            .await
            .map_err(UploadError::Complete)?;
        session.finish(SessionState::Completed);

        Ok(UploadSummary {
            bucket: session.target.bucket.clone(),
            key: session.target.key.clone(),
            upload_id: session.upload_id.clone(),
            location: completed.location,
            etag: completed.etag,
            parts: parts.len(),
            bytes,
        })
    }

    /// Abort a multipart upload. Failures are logged, never returned.
    async fn abort(&self, session: &mut UploadSession, cause: &UploadError) {
        if !session.finish(SessionState::Aborted) {
            return;
        }

        tracing::warn!(
            upload_id = %session.upload_id,
            error = %cause,
            "Aborting multipart upload"
        );

        match self
            .storage
            .abort_upload(&session.target, &session.upload_id)
            .await
        {
            Ok(()) => {
                metrics::record_upload_aborted();
                tracing::info!(upload_id = %session.upload_id, "Aborted multipart upload");
            }
            Err(e) => {
                metrics::record_abort_failure();
                tracing::error!(
                    upload_id = %session.upload_id,
                    error = %e,
                    cause = %cause,
                    "Failed to abort multipart upload"
                );
            }
        }
    }
}
