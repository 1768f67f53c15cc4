use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lambda_live_proto::PointerProperties;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, warn};

use crate::error::StorageError;

const POINTER_PREFIX: &str = "pointers";

/// Object storage for envelopes too large to travel inline.
///
/// Each oversized envelope is written once under `pointers/<uuid>` and is
/// deleted by whoever reads it back.
#[derive(Clone)]
pub struct PayloadStore {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    gzip: bool,
}

impl std::fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStore")
            .field("bucket", &self.bucket)
            .field("gzip", &self.gzip)
            .finish()
    }
}

impl PayloadStore {
    /// S3-backed store. Credentials come from the standard AWS environment.
    pub fn s3(
        bucket: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
        gzip: bool,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Build(e.to_string()))?;
        Ok(Self::with_store(bucket, Arc::new(store), gzip))
    }

    pub fn in_memory(bucket: &str, gzip: bool) -> Self {
        Self::with_store(bucket, Arc::new(InMemory::new()), gzip)
    }

    pub fn with_store(bucket: &str, store: Arc<dyn ObjectStore>, gzip: bool) -> Self {
        Self {
            bucket: bucket.to_string(),
            store,
            gzip,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Uploads `data` and returns the pointer describing where it went.
    pub async fn put(&self, data: Vec<u8>) -> Result<PointerProperties, StorageError> {
        let key = format!("{POINTER_PREFIX}/{}", uuid::Uuid::new_v4());
        let body = if self.gzip { compress(&data)? } else { data };
        let size = body.len();

        self.store
            .put(&Path::from(key.as_str()), PutPayload::from(body))
            .await?;
        debug!(bucket = %self.bucket, key = %key, size, gzip = self.gzip, "Offloaded payload");

        Ok(PointerProperties {
            bucket: self.bucket.clone(),
            key,
            gzip: self.gzip,
        })
    }

    /// Downloads the object a pointer names and deletes it.
    ///
    /// Deletion is best effort: a failure is logged and the payload is still
    /// returned.
    pub async fn take(&self, pointer: &PointerProperties) -> Result<Vec<u8>, StorageError> {
        if pointer.bucket != self.bucket {
            return Err(StorageError::ForeignBucket {
                expected: self.bucket.clone(),
                actual: pointer.bucket.clone(),
            });
        }

        let path = Path::from(pointer.key.as_str());
        let bytes = self.store.get(&path).await?.bytes().await?;
        let data = if pointer.gzip {
            decompress(&bytes)?
        } else {
            bytes.to_vec()
        };

        if let Err(e) = self.store.delete(&path).await {
            warn!(bucket = %self.bucket, key = %pointer.key, error = %e, "Failed to delete offloaded payload");
        }
        Ok(data)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(StorageError::Gzip)?;
    encoder.finish().map_err(StorageError::Gzip)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut decoder = GzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(StorageError::Gzip)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_take_removes_the_object() {
        let store = PayloadStore::in_memory("live-bucket", true);
        let pointer = store.put(b"payload".to_vec()).await.unwrap();

        assert_eq!(pointer.bucket, "live-bucket");
        assert!(pointer.key.starts_with("pointers/"));
        assert!(pointer.gzip);

        let data = store.take(&pointer).await.unwrap();
        assert_eq!(data, b"payload");

        let second = store.take(&pointer).await;
        assert!(matches!(second, Err(StorageError::ObjectStore(_))));
    }

    #[tokio::test]
    async fn uncompressed_objects_are_stored_verbatim() {
        let store = PayloadStore::in_memory("b", false);
        let pointer = store.put(b"raw".to_vec()).await.unwrap();

        let path = Path::from(pointer.key.as_str());
        let stored = store
            .object_store()
            .get(&path)
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"raw");
    }

    #[tokio::test]
    async fn pointers_to_other_buckets_are_rejected() {
        let store = PayloadStore::in_memory("mine", false);
        let pointer = PointerProperties {
            bucket: "theirs".into(),
            key: "pointers/x".into(),
            gzip: false,
        };
        let err = store.take(&pointer).await.unwrap_err();
        assert!(matches!(err, StorageError::ForeignBucket { .. }));
    }

    #[test]
    fn gzip_compresses_repetitive_payloads() {
        let data = vec![b'a'; 64 * 1024];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len() / 10);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }
}
