use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{
    ByteRange, ByteStream, CompletedPart, ListingOptions, ObjectMeta, ObjectStore, PageStream,
    PutOptions, ResponseOverrides,
};
use depot_storage::MemoryBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// A one-shot failure armed on a [`FaultyBackend`].
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next single-request put fails.
    Put,
    /// The next delete fails.
    Delete,
    /// The upload is expired just before part `n` arrives.
    ExpireAtPart(u32),
    /// The next copy-part request fails.
    CopyPart,
    /// The next completion fails.
    Complete,
}

/// Wraps a [`MemoryBackend`] and fails selected calls on demand.
#[allow(dead_code)]
pub struct FaultyBackend {
    inner: Arc<MemoryBackend>,
    faults: Mutex<Vec<Fault>>,
    pub part_uploads: AtomicUsize,
    pub copy_parts: AtomicUsize,
}

#[allow(dead_code)]
impl FaultyBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Vec::new()),
            part_uploads: AtomicUsize::new(0),
            copy_parts: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &Arc<MemoryBackend> {
        &self.inner
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Consume `fault` if it is armed.
    fn trip(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == fault) {
            Some(index) => {
                faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn injected(operation: &'static str, key: &str) -> StorageError {
        StorageError::BackendUnavailable {
            operation,
            key: key.to_string(),
            source: "injected fault".into(),
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str, range: Option<ByteRange>) -> StorageResult<ByteStream> {
        self.inner.get_stream(key, range).await
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        self.inner.get_range(key, start, end).await
    }

    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()> {
        if self.trip(Fault::Put) {
            return Err(Self::injected("put", key));
        }
        self.inner.put(key, data, options).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.trip(Fault::Delete) {
            return Err(Self::injected("delete", key));
        }
        self.inner.delete(key).await
    }

    async fn copy(&self, from: &str, to: &str, options: &PutOptions) -> StorageResult<()> {
        self.inner.copy(from, to, options).await
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        self.inner.list_pages(prefix, options)
    }

    async fn create_multipart(&self, key: &str, options: &PutOptions) -> StorageResult<String> {
        self.inner.create_multipart(key, options).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        if self.trip(Fault::ExpireAtPart(part_number)) {
            self.inner.expire_upload(upload_id);
        }
        self.inner
            .upload_part(key, upload_id, part_number, data)
            .await
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String> {
        self.copy_parts.fetch_add(1, Ordering::SeqCst);
        if self.trip(Fault::CopyPart) {
            return Err(Self::injected("upload_part_copy", key));
        }
        self.inner
            .upload_part_copy(key, upload_id, part_number, source, range)
            .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        if self.trip(Fault::Complete) {
            return Err(Self::injected("complete_multipart", key));
        }
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.abort_multipart(key, upload_id).await
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<Url> {
        self.inner.presign_get(key, expires_in, overrides).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
