//! In-memory multipart storage
//!
//! Records every call, assembles objects on completion and can be told to
//! fail specific operations. Completion is validated the way S3 does it:
//! the part list must be non-empty, ascending, and match the uploaded ETags.

use super::{
    CompletedUpload, MultipartStorage, ObjectTarget, PartRecord, StorageError, UploadOptions,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// A call made against [`MemoryStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Create {
        key: String,
        options: UploadOptions,
    },
    UploadPart {
        upload_id: String,
        part_number: i32,
        size: usize,
    },
    Complete {
        upload_id: String,
        parts: Vec<PartRecord>,
    },
    Abort {
        upload_id: String,
    },
}

#[derive(Debug, Default)]
struct Failures {
    create: bool,
    part: Option<i32>,
    complete: bool,
    abort: bool,
}

#[derive(Debug)]
struct PendingUpload {
    target: ObjectTarget,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<ObjectKey, Bytes>,
    calls: Vec<StorageCall>,
}

type ObjectKey = (String, String);

/// In-memory [`MultipartStorage`]
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    failures: Failures,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every create call
    pub fn fail_create(mut self) -> Self {
        self.failures.create = true;
        self
    }

    /// Fail the upload of the given part number
    pub fn fail_part(mut self, part_number: i32) -> Self {
        self.failures.part = Some(part_number);
        self
    }

    /// Fail every complete call
    pub fn fail_complete(mut self) -> Self {
        self.failures.complete = true;
        self
    }

    /// Fail every abort call
    pub fn fail_abort(mut self) -> Self {
        self.failures.abort = true;
        self
    }

    /// All calls, in the order they were made
    pub fn calls(&self) -> Vec<StorageCall> {
        self.state.lock().calls.clone()
    }

    /// Number of uploaded parts (successful or not)
    pub fn part_calls(&self) -> usize {
        self.count(|call| matches!(call, StorageCall::UploadPart { .. }))
    }

    pub fn complete_calls(&self) -> usize {
        self.count(|call| matches!(call, StorageCall::Complete { .. }))
    }

    pub fn abort_calls(&self) -> usize {
        self.count(|call| matches!(call, StorageCall::Abort { .. }))
    }

    /// Sizes of the parts sent, in call order
    pub fn part_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StorageCall::UploadPart { size, .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    /// Committed object content
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    fn count(&self, predicate: impl Fn(&StorageCall) -> bool) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

fn unknown_upload(upload_id: &str) -> StorageError {
    StorageError::InvalidRequest(format!("NoSuchUpload: {}", upload_id))
}

#[async_trait]
impl MultipartStorage for MemoryStorage {
    async fn create_upload(
        &self,
        target: &ObjectTarget,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Create {
            key: target.key.clone(),
            options: options.clone(),
        });

        if self.failures.create {
            return Err(StorageError::Request("injected create failure".into()));
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                target: target.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartRecord, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::UploadPart {
            upload_id: upload_id.to_string(),
            part_number,
            size: body.len(),
        });

        if self.failures.part == Some(part_number) {
            return Err(StorageError::Request(format!(
                "injected failure for part {}",
                part_number
            )));
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| unknown_upload(upload_id))?;
        let etag = format!("\"part-{}\"", uuid::Uuid::new_v4());
        upload.parts.insert(part_number, (etag.clone(), body));

        Ok(PartRecord { part_number, etag })
    }

    async fn complete_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedUpload, StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Complete {
            upload_id: upload_id.to_string(),
            parts: parts.to_vec(),
        });

        if self.failures.complete {
            return Err(StorageError::Request("injected complete failure".into()));
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| unknown_upload(upload_id))?;

        if parts.is_empty() {
            return Err(StorageError::InvalidRequest("MalformedXML: no parts".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::InvalidRequest("InvalidPartOrder".into()));
        }

        let mut object = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => object.extend_from_slice(data),
                _ => {
                    return Err(StorageError::InvalidRequest(format!(
                        "InvalidPart: {}",
                        part.part_number
                    )))
                }
            }
        }

        let Some(upload) = state.uploads.remove(upload_id) else {
            return Err(unknown_upload(upload_id));
        };
        let location = format!(
            "memory://{}/{}",
            upload.target.bucket, upload.target.key
        );
        state
            .objects
            .insert((upload.target.bucket, upload.target.key), object.freeze());

        Ok(CompletedUpload {
            location: Some(location),
            etag: Some(format!("\"{}-{}\"", uuid::Uuid::new_v4(), parts.len())),
        })
    }

    async fn abort_upload(
        &self,
        _target: &ObjectTarget,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.calls.push(StorageCall::Abort {
            upload_id: upload_id.to_string(),
        });

        if self.failures.abort {
            return Err(StorageError::Request("injected abort failure".into()));
        }

        state.uploads.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_assembles_parts_in_order() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "key");
        let id = storage
            .create_upload(&target, &UploadOptions::default())
            .await
            .unwrap();

        let p2 = storage
            .upload_part(&target, &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = storage
            .upload_part(&target, &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        storage.complete_upload(&target, &id, &[p1, p2]).await.unwrap();

        assert_eq!(storage.object("bucket", "key").unwrap(), "hello world");
        assert_eq!(storage.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_etag() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "key");
        let id = storage
            .create_upload(&target, &UploadOptions::default())
            .await
            .unwrap();
        storage
            .upload_part(&target, &id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let bogus = PartRecord {
            part_number: 1,
            etag: "\"nope\"".into(),
        };
        let result = storage.complete_upload(&target, &id, &[bogus]).await;

        assert!(matches!(result, Err(StorageError::InvalidRequest(_))));
        assert!(storage.object("bucket", "key").is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_upload() {
        let storage = MemoryStorage::new();
        let target = ObjectTarget::new("bucket", "key");
        let id = storage
            .create_upload(&target, &UploadOptions::default())
            .await
            .unwrap();

        storage.abort_upload(&target, &id).await.unwrap();

        assert_eq!(storage.open_uploads(), 0);
        assert_eq!(storage.abort_calls(), 1);
    }
}
