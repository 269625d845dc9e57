//! Multipart upload sessions.
//!
//! A session moves `Initiated -> Uploading* -> Completed | Aborted`. Exactly
//! one terminal transition succeeds: completing an aborted session or
//! aborting a completed one is rejected.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, CompletedPart, ObjectStore, PutOptions};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Lifecycle of a multipart session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    Uploading,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open multipart upload, owned by the caller that initiated it.
#[derive(Debug)]
pub struct MultipartSession {
    upload_id: String,
    key: String,
    parts: Vec<CompletedPart>,
    next_part_number: u32,
    state: SessionState,
    bytes: u64,
}

impl MultipartSession {
    fn new(key: String, upload_id: String) -> Self {
        Self {
            upload_id,
            key,
            parts: Vec::new(),
            next_part_number: 1,
            state: SessionState::Initiated,
            bytes: 0,
        }
    }

    /// Rebuild a session from an upload id handed out earlier.
    ///
    /// Used by callers that drive chunked uploads across requests: the parts
    /// are re-supplied at completion time.
    pub fn resume(
        key: impl Into<String>,
        upload_id: impl Into<String>,
        parts: Vec<CompletedPart>,
    ) -> Self {
        let mut session = Self::new(key.into(), upload_id.into());
        session.next_part_number = parts.iter().map(|p| p.part_number).max().unwrap_or(0) + 1;
        if !parts.is_empty() {
            session.state = SessionState::Uploading;
        }
        session.parts = parts;
        session
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn next_part_number(&self) -> u32 {
        self.next_part_number
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes uploaded through this session object.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn record(&mut self, part: CompletedPart, bytes: u64) {
        self.next_part_number = self.next_part_number.max(part.part_number + 1);
        self.parts.push(part);
        self.bytes += bytes;
        self.state = SessionState::Uploading;
    }

    fn ensure_open(&self, operation: &'static str) -> StorageResult<()> {
        if self.state.is_terminal() {
            return Err(StorageError::InvalidSessionState {
                upload_id: self.upload_id.clone(),
                state: self.state.as_str(),
                operation,
            });
        }
        Ok(())
    }
}

impl Drop for MultipartSession {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                state = %self.state,
                "Multipart session dropped without complete or abort"
            );
        }
    }
}

/// Split `size` bytes into copy ranges of `chunk_size`.
///
/// A trailing remainder below `min_part_size` is folded into the previous
/// range so every range but the last satisfies the backend minimum.
pub fn copy_ranges(size: u64, chunk_size: u64, min_part_size: u64) -> Vec<ByteRange> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size).min(size);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }

    if ranges.len() > 1
        && let Some(last) = ranges.last().copied()
        && last.len() < min_part_size
    {
        ranges.pop();
        if let Some(previous) = ranges.last_mut() {
            previous.end = last.end;
        }
    }

    ranges
}

/// Drives multipart sessions against one backend.
#[derive(Clone)]
pub struct ChunkSessionManager {
    store: Arc<dyn ObjectStore>,
    chunk_size: u64,
    min_part_size: u64,
}

impl fmt::Debug for ChunkSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSessionManager")
            .field("backend", &self.store.backend_name())
            .field("chunk_size", &self.chunk_size)
            .field("min_part_size", &self.min_part_size)
            .finish()
    }
}

impl ChunkSessionManager {
    pub fn new(store: Arc<dyn ObjectStore>, chunk_size: u64, min_part_size: u64) -> Self {
        Self {
            store,
            chunk_size,
            min_part_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    /// Whether a payload of `size` bytes takes the multipart path. Always
    /// false when the store cannot do multipart.
    pub fn is_large(&self, size: u64) -> bool {
        size >= self.chunk_size && self.store.supports_multipart()
    }

    #[instrument(skip(self, options))]
    pub async fn initiate(&self, key: &str, options: &PutOptions) -> StorageResult<MultipartSession> {
        let upload_id = self
            .store
            .create_multipart(key, options)
            .await
            .map_err(|e| match e {
                StorageError::InitiationFailed { .. } => e,
                other => StorageError::InitiationFailed {
                    key: key.to_string(),
                    source: Box::new(other),
                },
            })?;

        tracing::debug!(key = %key, upload_id = %upload_id, "Multipart session initiated");
        Ok(MultipartSession::new(key.to_string(), upload_id))
    }

    /// Upload `data` as `part_number`, which must not go backwards.
    #[instrument(skip(self, session, data), fields(key = %session.key, upload_id = %session.upload_id, size = data.len()))]
    pub async fn upload_part(
        &self,
        session: &mut MultipartSession,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        session.ensure_open("upload part")?;
        Self::check_part_number(session, part_number)?;

        let size = data.len() as u64;
        let result = self
            .store
            .upload_part(&session.key, &session.upload_id, part_number, data)
            .await;

        match result {
            Ok(etag) => {
                session.record(
                    CompletedPart {
                        part_number,
                        etag: etag.clone(),
                    },
                    size,
                );
                Ok(etag)
            }
            Err(e) => Err(self.fail(session, e).await),
        }
    }

    /// Upload `data` as the next part.
    pub async fn upload_next(
        &self,
        session: &mut MultipartSession,
        data: Bytes,
    ) -> StorageResult<String> {
        let part_number = session.next_part_number;
        self.upload_part(session, part_number, data).await
    }

    /// Server-side copy of `range` of `source` as `part_number`.
    #[instrument(skip(self, session), fields(key = %session.key, upload_id = %session.upload_id))]
    pub async fn upload_part_copy(
        &self,
        session: &mut MultipartSession,
        part_number: u32,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String> {
        session.ensure_open("copy part")?;
        Self::check_part_number(session, part_number)?;

        let result = self
            .store
            .upload_part_copy(&session.key, &session.upload_id, part_number, source, range)
            .await;

        match result {
            Ok(etag) => {
                session.record(
                    CompletedPart {
                        part_number,
                        etag: etag.clone(),
                    },
                    range.len(),
                );
                Ok(etag)
            }
            Err(e) => Err(self.fail(session, e).await),
        }
    }

    /// Server-side copy of `range` of `source` as the next part.
    pub async fn copy_next(
        &self,
        session: &mut MultipartSession,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String> {
        let part_number = session.next_part_number;
        self.upload_part_copy(session, part_number, source, range)
            .await
    }

    /// Complete the session. Parts are submitted sorted by part number.
    #[instrument(skip(self, session), fields(key = %session.key, upload_id = %session.upload_id))]
    pub async fn complete(&self, session: &mut MultipartSession) -> StorageResult<()> {
        session.ensure_open("complete")?;
        if session.parts.is_empty() {
            return Err(StorageError::IncompleteUpload(session.key.clone()));
        }

        session.parts.sort_by_key(|p| p.part_number);
        let result = self
            .store
            .complete_multipart(&session.key, &session.upload_id, &session.parts)
            .await;

        match result {
            Ok(()) => {
                session.state = SessionState::Completed;
                tracing::debug!(
                    key = %session.key,
                    upload_id = %session.upload_id,
                    parts = session.parts.len(),
                    "Multipart session completed"
                );
                Ok(())
            }
            Err(e) => Err(self.fail(session, e).await),
        }
    }

    /// Abort the session. Idempotent; an upload the backend already forgot counts as aborted.
    #[instrument(skip(self, session), fields(key = %session.key, upload_id = %session.upload_id))]
    pub async fn abort(&self, session: &mut MultipartSession) -> StorageResult<()> {
        match session.state {
            SessionState::Aborted => return Ok(()),
            SessionState::Completed => {
                return Err(StorageError::InvalidSessionState {
                    upload_id: session.upload_id.clone(),
                    state: session.state.as_str(),
                    operation: "abort",
                });
            }
            SessionState::Initiated | SessionState::Uploading => {}
        }

        match self
            .store
            .abort_multipart(&session.key, &session.upload_id)
            .await
        {
            Ok(()) => {}
            Err(StorageError::SessionExpired { .. }) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(
                    key = %session.key,
                    upload_id = %session.upload_id,
                    "Multipart upload already gone on abort"
                );
            }
            Err(e) => return Err(e),
        }

        session.state = SessionState::Aborted;
        Ok(())
    }

    /// Abort without surfacing cleanup errors.
    pub async fn abort_quietly(&self, session: &mut MultipartSession) {
        if let Err(e) = self.abort(session).await {
            tracing::warn!(
                key = %session.key,
                upload_id = %session.upload_id,
                error = %e,
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }

    /// Turn a backend failure into the error to return, releasing a dead session.
    async fn fail(&self, session: &mut MultipartSession, err: StorageError) -> StorageError {
        if matches!(err, StorageError::SessionExpired { .. }) {
            tracing::warn!(
                key = %session.key,
                upload_id = %session.upload_id,
                "Multipart session expired on the backend, aborting"
            );
            self.abort_quietly(session).await;
            return StorageError::SessionExpired {
                key: session.key.clone(),
                upload_id: session.upload_id.clone(),
            };
        }
        err
    }

    fn check_part_number(session: &MultipartSession, part_number: u32) -> StorageResult<()> {
        let last = session.parts.iter().map(|p| p.part_number).max().unwrap_or(0);
        if part_number == 0 || part_number <= last {
            return Err(StorageError::InvalidPartNumber {
                part_number,
                expected: last + 1,
            });
        }
        Ok(())
    }

    /// Write `data`, using a multipart session at or above the chunk size.
    #[instrument(skip(self, data, options, cancel), fields(size = data.len()))]
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let size = data.len() as u64;
        if !self.is_large(size) {
            self.store.put(key, data, options).await?;
            return Ok(size);
        }

        let mut session = self.initiate(key, options).await?;
        let result = async {
            let mut offset = 0usize;
            while offset < data.len() {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let end = (offset + self.chunk_size as usize).min(data.len());
                self.upload_next(&mut session, data.slice(offset..end))
                    .await?;
                offset = end;
            }
            self.complete(&mut session).await
        }
        .await;

        self.finish(&mut session, result).await?;
        Ok(size)
    }

    /// Drain `stream` into `key`. Small payloads become a single put.
    #[instrument(skip(self, stream, options, cancel))]
    pub async fn put_stream(
        &self,
        key: &str,
        mut stream: ByteStream,
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        // Without multipart the whole payload is buffered into one put.
        let chunk_size = if self.store.supports_multipart() {
            self.chunk_size as usize
        } else {
            usize::MAX
        };
        let mut buffer = BytesMut::new();
        let mut session: Option<MultipartSession> = None;
        let mut total = 0u64;

        let result: StorageResult<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                total += chunk.len() as u64;
                buffer.extend_from_slice(&chunk);

                while buffer.len() >= chunk_size {
                    if cancel.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    let part = buffer.split_to(chunk_size).freeze();
                    if session.is_none() {
                        session = Some(self.initiate(key, options).await?);
                    }
                    if let Some(session) = session.as_mut() {
                        self.upload_next(session, part).await?;
                    }
                }
            }

            match session.as_mut() {
                Some(session) => {
                    if !buffer.is_empty() {
                        self.upload_next(session, buffer.split().freeze()).await?;
                    }
                    self.complete(session).await
                }
                None => self.store.put(key, buffer.split().freeze(), options).await,
            }
        }
        .await;

        match session.as_mut() {
            Some(session) => self.finish(session, result).await?,
            None => result?,
        }
        Ok(total)
    }

    /// Server-side copy, splitting objects at or above the chunk size into
    /// concurrent copy-part requests.
    #[instrument(skip(self, options, cancel))]
    pub async fn copy(
        &self,
        from: &str,
        to: &str,
        size: u64,
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        if !self.is_large(size) {
            return self.store.copy(from, to, options).await;
        }

        let mut session = self.initiate(to, options).await?;
        let ranges = copy_ranges(size, self.chunk_size, self.min_part_size);

        let upload_id = session.upload_id.clone();
        let copies = ranges.into_iter().enumerate().map(|(index, range)| {
            let store = &self.store;
            let upload_id = upload_id.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let part_number = index as u32 + 1;
                let etag = store
                    .upload_part_copy(to, &upload_id, part_number, from, range)
                    .await?;
                Ok::<_, StorageError>((CompletedPart { part_number, etag }, range.len()))
            }
        });

        let result = match futures::future::try_join_all(copies).await {
            Ok(mut parts) => {
                parts.sort_by_key(|(part, _)| part.part_number);
                for (part, bytes) in parts {
                    session.record(part, bytes);
                }
                self.complete(&mut session).await
            }
            Err(e) => Err(self.fail(&mut session, e).await),
        };
        self.finish(&mut session, result).await
    }

    /// Abort an unfinished session when `result` is an error, then return it.
    pub(crate) async fn finish(
        &self,
        session: &mut MultipartSession,
        result: StorageResult<()>,
    ) -> StorageResult<()> {
        if let Err(e) = result {
            if !session.state.is_terminal() {
                self.abort_quietly(session).await;
            }
            return Err(e);
        }
        Ok(())
    }
}
