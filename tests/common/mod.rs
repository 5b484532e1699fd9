//! Shared test infrastructure
//!
//! - Deterministic data sources
//! - A storage wrapper that slows uploads and watches buffering
//! - S3 API mocks for wiremock

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cmd2s3::config::S3Config;
use cmd2s3::s3::S3Client;
use cmd2s3::storage::{
    CompletedUpload, MemoryStorage, MultipartStorage, ObjectTarget, PartRecord, StorageError,
    UploadOptions,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const MIB: usize = 1024 * 1024;

/// Test bucket name
pub const TEST_BUCKET: &str = "test-bucket";

/// Seeded random payload
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Byte at `position` of the [`PatternReader`] stream
pub fn pattern_byte(position: u64) -> u8 {
    (position.wrapping_mul(31) ^ (position >> 11)) as u8
}

/// Generates `len` deterministic bytes without holding them in memory and
/// counts how many were handed out
pub struct PatternReader {
    position: u64,
    len: u64,
    served: Arc<AtomicU64>,
}

impl PatternReader {
    pub fn new(len: u64) -> Self {
        Self {
            position: 0,
            len,
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of bytes read so far
    pub fn served(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.served)
    }
}

impl AsyncRead for PatternReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let left = self.len - self.position;
        let n = (buf.remaining() as u64).min(left).min(64 * 1024) as usize;
        let start = self.position;
        let bytes: Vec<u8> = (start..start + n as u64).map(pattern_byte).collect();
        buf.put_slice(&bytes);
        self.position += n as u64;
        self.served.fetch_add(n as u64, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Storage that delays every part upload and records how many source bytes
/// were read but not yet handed to storage when each part arrived
pub struct SlowStorage {
    inner: MemoryStorage,
    delay: Duration,
    served: Arc<AtomicU64>,
    accepted: AtomicU64,
    max_outstanding: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowStorage {
    pub fn new(delay: Duration, served: Arc<AtomicU64>) -> Self {
        Self {
            inner: MemoryStorage::new(),
            delay,
            served,
            accepted: AtomicU64::new(0),
            max_outstanding: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn memory(&self) -> &MemoryStorage {
        &self.inner
    }

    /// Largest number of bytes read from the source but not yet accepted by
    /// storage, counting the part being uploaded
    pub fn max_outstanding(&self) -> u64 {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MultipartStorage for SlowStorage {
    async fn create_upload(
        &self,
        target: &ObjectTarget,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        self.inner.create_upload(target, options).await
    }

    async fn upload_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartRecord, StorageError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let outstanding = self.served.load(Ordering::SeqCst) - self.accepted.load(Ordering::SeqCst);
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);

        let len = body.len() as u64;
        let result = self.inner.upload_part(target, upload_id, part_number, body).await;
        self.accepted.fetch_add(len, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn complete_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedUpload, StorageError> {
        self.inner.complete_upload(target, upload_id, parts).await
    }

    async fn abort_upload(&self, target: &ObjectTarget, upload_id: &str) -> Result<(), StorageError> {
        self.inner.abort_upload(target, upload_id).await
    }
}

// ============================================================================
// S3 mocks
// ============================================================================

/// S3 client pointing to a mock server
pub async fn create_test_s3_client(mock_server: &MockServer) -> S3Client {
    S3Client::from_config(&test_s3_config(mock_server)).await
}

pub fn test_s3_config(mock_server: &MockServer) -> S3Config {
    S3Config {
        region: Some("us-east-1".to_string()),
        endpoint: Some(mock_server.uri()),
        access_key: Some("test-access".to_string()),
        secret_key: Some("test-secret".to_string()),
        force_path_style: true,
    }
}

/// Mount CreateMultipartUpload for `key`
pub async fn mock_create(mock_server: &MockServer, key: &str, upload_id: &str, expect: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/{}/{}", TEST_BUCKET, key)))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <InitiateMultipartUploadResult>
                <Bucket>{}</Bucket>
                <Key>{}</Key>
                <UploadId>{}</UploadId>
            </InitiateMultipartUploadResult>"#,
            TEST_BUCKET, key, upload_id
        )))
        .expect(expect)
        .mount(mock_server)
        .await;
}

/// Mount UploadPart for one part number
pub async fn mock_upload_part(
    mock_server: &MockServer,
    key: &str,
    upload_id: &str,
    part_number: i32,
    expect: u64,
) {
    Mock::given(method("PUT"))
        .and(path(format!("/{}/{}", TEST_BUCKET, key)))
        .and(query_param("uploadId", upload_id))
        .and(query_param("partNumber", part_number.to_string()))
        .respond_with(
            ResponseTemplate::new(200).insert_header("ETag", format!("\"etag-{}\"", part_number)),
        )
        .expect(expect)
        .mount(mock_server)
        .await;
}

/// Mount CompleteMultipartUpload
pub async fn mock_complete(mock_server: &MockServer, key: &str, upload_id: &str, expect: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/{}/{}", TEST_BUCKET, key)))
        .and(query_param("uploadId", upload_id))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <CompleteMultipartUploadResult>
                <Location>http://localhost/{0}/{1}</Location>
                <Bucket>{0}</Bucket>
                <Key>{1}</Key>
                <ETag>"final-etag"</ETag>
            </CompleteMultipartUploadResult>"#,
            TEST_BUCKET, key
        )))
        .expect(expect)
        .mount(mock_server)
        .await;
}

/// Mount AbortMultipartUpload
pub async fn mock_abort(mock_server: &MockServer, key: &str, upload_id: &str, expect: u64) {
    Mock::given(method("DELETE"))
        .and(path(format!("/{}/{}", TEST_BUCKET, key)))
        .and(query_param("uploadId", upload_id))
        .respond_with(ResponseTemplate::new(204))
        .expect(expect)
        .mount(mock_server)
        .await;
}

/// S3 error response body
pub fn s3_error_body(code: &str, message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
        <Error>
            <Code>{}</Code>
            <Message>{}</Message>
            <RequestId>test-request</RequestId>
        </Error>"#,
        code, message
    )
}
