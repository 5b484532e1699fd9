//! `s3://bucket/key` destination parsing

use crate::storage::ObjectTarget;
use thiserror::Error;

/// URL errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlError {
    #[error("only s3 urls supported, got: {0:?}")]
    UnsupportedScheme(String),

    #[error("missing bucket in {0:?}")]
    MissingBucket(String),

    #[error("missing object key in {0:?}")]
    MissingKey(String),
}

/// Parse an `s3://bucket/key` URL into an upload target.
///
/// The key is everything after the first `/` following the bucket, so it
/// may itself contain slashes.
pub fn parse_s3_url(url: &str) -> Result<ObjectTarget, UrlError> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| UrlError::UnsupportedScheme(url.to_string()))?;

    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(UrlError::MissingBucket(url.to_string()));
    }
    if key.is_empty() {
        return Err(UrlError::MissingKey(url.to_string()));
    }

    Ok(ObjectTarget::new(bucket, key))
}
