//! In-memory backend.
//!
//! Mirrors the multipart rules of S3 closely enough to exercise the engine:
//! parts below the minimum size are rejected unless they are the last part,
//! and unknown upload ids behave like a backend "no such upload" error.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ByteStream, CompletedPart, ListEntry, ListingOptions, ListingPage, ObjectMeta,
    ObjectStore, PageStream, PutOptions, ResponseOverrides,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    options: PutOptions,
    etag: String,
    last_modified: OffsetDateTime,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    options: PutOptions,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    min_part_size: u64,
    aborts: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(depot_core::DEFAULT_MIN_PART_SIZE)
    }
}

impl MemoryBackend {
    /// Create a backend enforcing `min_part_size` on every part but the last.
    pub fn new(min_part_size: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            min_part_size,
            aborts: AtomicUsize::new(0),
        }
    }

    /// Number of multipart uploads that are open.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Number of abort requests received, successful or not.
    pub fn abort_calls(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Forget an upload as if the backend had expired it.
    pub fn expire_upload(&self, upload_id: &str) -> bool {
        self.state.lock().uploads.remove(upload_id).is_some()
    }

    /// Attributes an object was written with.
    pub fn object_options(&self, key: &str) -> Option<PutOptions> {
        self.state
            .lock()
            .objects
            .get(key)
            .map(|obj| obj.options.clone())
    }

    /// Set an object's modification time. Returns false when it is absent.
    pub fn touch(&self, key: &str, last_modified: OffsetDateTime) -> bool {
        match self.state.lock().objects.get_mut(key) {
            Some(obj) => {
                obj.last_modified = last_modified;
                true
            }
            None => false,
        }
    }

    /// Total bytes currently stored.
    pub fn stored_bytes(&self) -> u64 {
        self.state
            .lock()
            .objects
            .values()
            .map(|obj| obj.data.len() as u64)
            .sum()
    }

    fn store(&self, key: &str, data: Bytes, options: PutOptions) {
        let object = StoredObject {
            data,
            options,
            etag: new_etag(),
            last_modified: OffsetDateTime::now_utc(),
        };
        self.state.lock().objects.insert(key.to_string(), object);
    }

    fn object(&self, key: &str) -> StorageResult<StoredObject> {
        self.state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn slice(key: &str, data: &Bytes, range: ByteRange) -> StorageResult<Bytes> {
        if range.end < range.start {
            return Err(StorageError::InvalidRange(format!(
                "end ({}) < start ({})",
                range.end, range.start
            )));
        }
        let len = data.len() as u64;
        if range.start > len {
            return Err(StorageError::InvalidRange(format!(
                "range {range} starts past the end of {key} ({len} bytes)"
            )));
        }
        let end = range.end.min(len);
        Ok(data.slice(range.start as usize..end as usize))
    }

    fn expired(key: &str, upload_id: &str) -> StorageError {
        StorageError::SessionExpired {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        }
    }
}

fn new_etag() -> String {
    format!("\"{}\"", Uuid::new_v4().simple())
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.state.lock().objects.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let object = self.object(key)?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            content_type: object.options.content_type.clone(),
            etag: Some(object.etag),
            metadata: object.options.metadata,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Ok(self.object(key)?.data)
    }

    async fn get_stream(&self, key: &str, range: Option<ByteRange>) -> StorageResult<ByteStream> {
        let data = self.object(key)?.data;
        let data = match range {
            Some(range) => Self::slice(key, &data, range)?,
            None => data,
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let data = self.object(key)?.data;
        Self::slice(key, &data, ByteRange::new(start, end))
    }

    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()> {
        self.store(key, data, options.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match self.state.lock().objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn copy(&self, from: &str, to: &str, options: &PutOptions) -> StorageResult<()> {
        let source = self.object(from)?;
        let mut merged = options.clone();
        if merged.content_type.is_none() {
            merged.content_type = source.options.content_type;
        }
        if merged.metadata.is_empty() {
            merged.metadata = source.options.metadata;
        }
        self.store(to, source.data, merged);
        Ok(())
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let page_size = options.normalized_page_size();
        let entries: Vec<ListEntry> = self
            .state
            .lock()
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ListEntry {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
            })
            .collect();

        let pages: Vec<StorageResult<ListingPage>> = entries
            .chunks(page_size)
            .map(|chunk| {
                Ok(ListingPage {
                    entries: chunk.to_vec(),
                })
            })
            .collect();

        Box::pin(futures::stream::iter(pages))
    }

    async fn create_multipart(&self, key: &str, options: &PutOptions) -> StorageResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.state.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| Self::expired(key, upload_id))?;

        let etag = new_etag();
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String> {
        let data = self.object(source)?.data;
        if range.is_empty() || range.end > data.len() as u64 {
            return Err(StorageError::InvalidRange(format!(
                "copy range {range} outside {source} ({} bytes)",
                data.len()
            )));
        }
        let part = Self::slice(source, &data, range)?;
        self.upload_part(key, upload_id, part_number, part).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| Self::expired(key, upload_id))?;

        if parts.is_empty() {
            return Err(StorageError::IncompleteUpload(key.to_string()));
        }

        let mut body = BytesMut::new();
        let mut previous = 0;
        for (index, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StorageError::backend(
                    "complete_multipart",
                    key,
                    format!("parts out of order at part {}", part.part_number),
                ));
            }
            previous = part.part_number;

            let (etag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::backend(
                    "complete_multipart",
                    key,
                    format!("part {} was never uploaded", part.part_number),
                )
            })?;
            if *etag != part.etag {
                return Err(StorageError::backend(
                    "complete_multipart",
                    key,
                    format!("etag mismatch for part {}", part.part_number),
                ));
            }

            let is_last = index + 1 == parts.len();
            if !is_last && (data.len() as u64) < self.min_part_size {
                return Err(StorageError::EntityTooSmall(format!(
                    "{key} part {} is {} bytes (minimum {})",
                    part.part_number,
                    data.len(),
                    self.min_part_size
                )));
            }
            body.extend_from_slice(data);
        }

        let options = upload.options.clone();
        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body.freeze(),
                options,
                etag: new_etag(),
                last_modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        match self.state.lock().uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(Self::expired(key, upload_id)),
        }
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<Url> {
        let mut url = Url::parse("https://memory.invalid/")
            .and_then(|base| base.join(key))
            .map_err(|e| StorageError::backend("presign", key, e))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("X-Expires", &expires_in.as_secs().to_string());
            let pairs = [
                ("response-content-disposition", &overrides.content_disposition),
                ("response-cache-control", &overrides.cache_control),
                ("response-content-encoding", &overrides.content_encoding),
                ("response-content-language", &overrides.content_language),
                ("response-content-type", &overrides.content_type),
                ("response-expires", &overrides.expires),
            ];
            for (name, value) in pairs {
                if let Some(value) = value {
                    query.append_pair(name, value);
                }
            }
        }

        Ok(url)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn part(part_number: u32, etag: String) -> CompletedPart {
        CompletedPart { part_number, etag }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = MemoryBackend::default();
        backend
            .put("a/b", Bytes::from_static(b"hello"), &PutOptions::default())
            .await
            .unwrap();

        assert!(backend.exists("a/b").await.unwrap());
        assert_eq!(backend.head("a/b").await.unwrap().size, 5);
        assert_eq!(backend.get_range("a/b", 1, 3).await.unwrap(), "el");

        backend.delete("a/b").await.unwrap();
        assert!(backend.delete("a/b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_enforces_min_part_size() {
        let backend = MemoryBackend::new(4);
        let id = backend
            .create_multipart("k", &PutOptions::default())
            .await
            .unwrap();
        let e1 = backend
            .upload_part("k", &id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let e2 = backend
            .upload_part("k", &id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();

        let err = backend
            .complete_multipart("k", &id, &[part(1, e1.clone()), part(2, e2.clone())])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityTooSmall(_)));

        // Parts stay usable after a rejected completion.
        backend
            .complete_multipart("k", &id, &[part(1, e1)])
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), "ab");
        assert_eq!(backend.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_unknown_upload_is_session_expired() {
        let backend = MemoryBackend::default();
        let err = backend
            .upload_part("k", "missing", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn test_list_pages_filters_by_prefix() {
        let backend = MemoryBackend::default();
        for key in ["a/1", "a/2", "b/1"] {
            backend
                .put(key, Bytes::from_static(b"x"), &PutOptions::default())
                .await
                .unwrap();
        }

        let pages: Vec<_> = backend
            .list_pages("a/", ListingOptions::default())
            .collect()
            .await;
        let keys: Vec<String> = pages
            .into_iter()
            .flat_map(|p| p.unwrap().entries)
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }
}
