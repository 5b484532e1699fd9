//! S3 Client module
//!
//! [`MultipartStorage`] on top of the AWS SDK.
//!
//! # Example
//!
//! ```no_run
//! use cmd2s3::config::S3Config;
//! use cmd2s3::s3::S3Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = S3Config {
//!     region: Some("us-east-1".to_string()),
//!     endpoint: Some("http://localhost:9000".to_string()),
//!     access_key: Some("minioadmin".to_string()),
//!     secret_key: Some("minioadmin".to_string()),
//!     force_path_style: true,
//! };
//!
//! let client = S3Client::from_config(&config).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | CreateMultipartUpload | `s3.create_multipart_upload` | bucket, key, upload_id |
//! | UploadPart | `s3.upload_part` | bucket, upload_id, part_number, bytes, etag |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` | bucket, upload_id, parts_count, etag |
//! | AbortMultipartUpload | `s3.abort_multipart_upload` | bucket, upload_id |

use crate::config::S3Config;
use crate::storage::{
    CompletedUpload, Encryption, MultipartStorage, ObjectTarget, PartRecord, StorageError,
    UploadOptions,
};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use aws_sdk_s3::Client;
use bytes::Bytes;

mod url;

pub use url::{parse_s3_url, UrlError};

fn request_error<E>(err: E) -> StorageError
where
    E: std::error::Error + 'static,
{
    StorageError::Request(DisplayErrorContext(&err).to_string())
}

/// S3 Client
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
}

impl S3Client {
    /// Build a client from configuration.
    ///
    /// Unset fields fall back to the standard AWS environment and profile
    /// chain.
    pub async fn from_config(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "cmd2s3-config",
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self::from_sdk(Client::from_conf(builder.build()))
    }

    /// Wrap an already configured SDK client
    pub fn from_sdk(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MultipartStorage for S3Client {
    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, target, options),
        fields(
            s3.bucket = %target.bucket,
            s3.key = %target.key,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn create_upload(
        &self,
        target: &ObjectTarget,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key);

        match &options.server_side_encryption {
            Some(Encryption::Aes256) => {
                request = request.server_side_encryption(ServerSideEncryption::Aes256);
            }
            Some(Encryption::AwsKms { key_id }) => {
                request = request.server_side_encryption(ServerSideEncryption::AwsKms);
                if let Some(key_id) = key_id {
                    request = request.ssekms_key_id(key_id);
                }
            }
            None => {}
        }
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }

        let output = request.send().await.map_err(request_error)?;
        let upload_id = output
            .upload_id()
            .ok_or(StorageError::MissingField("UploadId"))?
            .to_string();

        tracing::Span::current().record("s3.upload_id", upload_id.as_str());

        Ok(upload_id)
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, target, body),
        fields(
            s3.bucket = %target.bucket,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartRecord, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(request_error)?;

        let etag = output
            .e_tag()
            .ok_or(StorageError::MissingField("ETag"))?
            .to_string();

        tracing::Span::current().record("s3.etag", etag.as_str());

        Ok(PartRecord { part_number, etag })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, target, parts),
        fields(
            s3.bucket = %target.bucket,
            s3.upload_id = %upload_id,
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn complete_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedUpload, StorageError> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let multipart = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(multipart)
            .send()
            .await
            .map_err(request_error)?;

        if let Some(etag) = output.e_tag() {
            tracing::Span::current().record("s3.etag", etag);
        }

        Ok(CompletedUpload {
            location: output.location().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
        })
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self, target),
        fields(
            s3.bucket = %target.bucket,
            s3.upload_id = %upload_id
        ),
        err
    )]
    async fn abort_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }
}
