//! Object-storage interface (S3-compatible transit bucket).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, VmshiftError};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload a local file, resuming a previous multipart upload when
    /// possible. Returns the object URL.
    async fn upload(&self, local_path: &Path, bucket: &str, key: &str, resumable: bool)
        -> Result<String>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// In-memory object store for tests and dry runs.
#[derive(Default)]
pub struct MockObjectStorage {
    objects: Mutex<HashMap<String, u64>>,
}

impl MockObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        _resumable: bool,
    ) -> Result<String> {
        let meta = tokio::fs::metadata(local_path).await.map_err(|e| {
            VmshiftError::Artifact(format!("upload source {} missing: {e}", local_path.display()))
        })?;
        self.objects
            .lock()
            .unwrap()
            .insert(Self::object_key(bucket, key), meta.len());
        Ok(format!("s3://{bucket}/{key}"))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&Self::object_key(bucket, key));
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains_key(&Self::object_key(bucket, key)))
    }
}
