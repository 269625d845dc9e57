//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::Acl;
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A stream of listing pages borrowing the store.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

/// A stream of listed objects borrowing the store.
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListEntry>> + Send + 'a>>;

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 10000;

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Number of keys to fetch per page, clamped to
    /// [`MIN_PAGE_SIZE`]..=[`MAX_PAGE_SIZE`].
    pub page_size: usize,
}

impl ListingOptions {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<time::OffsetDateTime>,
}

/// A single page of listing results.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    pub entries: Vec<ListEntry>,
}

/// Half-open byte range `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Range from `start` to the end of the object.
    pub fn from_offset(start: u64) -> Self {
        Self::new(start, u64::MAX)
    }

    /// HTTP `Range` header value. The wire format uses an inclusive end.
    pub fn to_header(&self) -> String {
        if self.end == u64::MAX {
            return format!("bytes={}-", self.start);
        }
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Server-side encryption requested from the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerSideEncryption {
    Aes256,
    Kms { key_id: String },
}

/// Attributes applied to a written object.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    /// Concrete ACL; `None` leaves the bucket default.
    pub acl: Option<Acl>,
    pub server_side_encryption: Option<ServerSideEncryption>,
    pub metadata: BTreeMap<String, String>,
}

/// Response headers the backend should return when a presigned URL is fetched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseOverrides {
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
    pub expires: Option<String>,
}

/// A part accepted by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Metadata about a stored object.
#[derive(Clone, Debug, Default)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// User metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Object store abstraction implemented once per backend.
///
/// Engine logic (key resolution, quota, multipart sessions, encryption)
/// is layered on top of this trait and never depends on a concrete backend.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object, or a range of it, as a byte stream.
    async fn get_stream(&self, key: &str, range: Option<ByteRange>) -> StorageResult<ByteStream>;

    /// Get the bytes in `[start, end)`.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Put an object in a single request.
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()>;

    /// Delete an object. Missing objects yield [`StorageError::NotFound`](crate::StorageError::NotFound).
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Server-side copy of an object below the backend's single-copy limit.
    async fn copy(&self, from: &str, to: &str, options: &PutOptions) -> StorageResult<()>;

    /// List objects with a prefix, one page at a time.
    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a>;

    /// Open a multipart upload and return its id.
    async fn create_multipart(&self, key: &str, options: &PutOptions) -> StorageResult<String>;

    /// Upload one part and return its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Copy `range` of `source` into the upload as one part and return its ETag.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String>;

    /// Assemble the object from `parts`, which must be sorted by part number.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Discard an upload and its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Signed, time-limited GET URL.
    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<Url>;

    /// Static backend identifier used in logs (e.g. "s3", "memory").
    fn backend_name(&self) -> &'static str;

    /// Whether multipart uploads and copy parts are available. Without them
    /// large payloads are written with a single [`put`](Self::put).
    fn supports_multipart(&self) -> bool {
        true
    }

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Flattens [`ObjectStore::list_pages`] into a stream of entries.
///
/// Implemented for every [`ObjectStore`]; do not implement it manually.
pub trait ObjectStoreListStreamExt: ObjectStore {
    fn list_entries<'a>(&'a self, prefix: &str) -> EntryStream<'a> {
        let page_stream = self.list_pages(prefix, ListingOptions::default());

        let entries = page_stream.flat_map(|page_result| match page_result {
            Ok(page) => futures::stream::iter(page.entries.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });

        Box::pin(entries)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreListStreamExt for T {}
