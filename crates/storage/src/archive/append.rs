//! Growing a remote tar stream member by member.
//!
//! The backend cannot append, so each append reopens the destination as a
//! multipart upload: the existing bytes are copied server-side in chunk-size
//! ranges, and the new bytes are uploaded as the final part. A remainder
//! below the minimum part size cannot be a copy part that is followed by
//! more parts, so it is downloaded and re-uploaded in front of the new bytes.

use super::header::{end_of_archive, member_header, padding_len};
use super::slots::{ExtensionSlotPool, SlotGuard};
use crate::error::{StorageError, StorageResult};
use crate::multipart::{ChunkSessionManager, MultipartSession, copy_ranges};
use crate::traits::{ByteRange, ObjectStore, PutOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// How an existing object is carried into a reopened upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReopenPlan {
    /// Ranges copied server-side, in order. Each is at least the minimum part size.
    pub copies: Vec<ByteRange>,
    /// Trailing bytes downloaded and re-uploaded with the new data.
    pub tail: ByteRange,
}

/// Plan how to carry `len` existing bytes into a new multipart upload.
pub fn plan_reopen(len: u64, chunk_size: u64, min_part_size: u64) -> ReopenPlan {
    if len == 0 {
        return ReopenPlan::default();
    }
    if len < min_part_size {
        return ReopenPlan {
            copies: Vec::new(),
            tail: ByteRange::new(0, len),
        };
    }

    let full = len / chunk_size * chunk_size;
    let mut copies: Vec<ByteRange> = (0..full)
        .step_by(chunk_size as usize)
        .map(|start| ByteRange::new(start, start + chunk_size))
        .collect();

    let remainder = ByteRange::new(full, len);
    let tail = if remainder.is_empty() {
        ByteRange::new(len, len)
    } else if remainder.len() < min_part_size {
        remainder
    } else {
        copies.push(remainder);
        ByteRange::new(len, len)
    };

    ReopenPlan { copies, tail }
}

/// Result of one append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Slot-suffixed key that received the member.
    pub key: String,
    pub slot: u32,
    /// Offset of the member header within the object.
    pub offset: u64,
    /// Object length after the append.
    pub len: u64,
}

/// Appends tar members to slot-suffixed objects under a base key.
#[derive(Clone, Debug)]
pub struct ArchiveAppendEngine {
    sessions: ChunkSessionManager,
    slots: ExtensionSlotPool,
    options: PutOptions,
}

impl ArchiveAppendEngine {
    pub fn new(sessions: ChunkSessionManager, slots: ExtensionSlotPool, options: PutOptions) -> Self {
        Self {
            sessions,
            slots,
            options,
        }
    }

    pub fn slots(&self) -> &ExtensionSlotPool {
        &self.slots
    }

    fn store(&self) -> &Arc<dyn ObjectStore> {
        self.sessions.store()
    }

    /// Destination key for `slot`.
    pub fn slot_key(base_key: &str, slot: u32) -> String {
        format!("{base_key}{slot}")
    }

    async fn current_len(&self, key: &str) -> StorageResult<u64> {
        match self.store().head(key).await {
            Ok(meta) => Ok(meta.size),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Append a member holding `payload`, waiting for a free slot.
    #[instrument(skip(self, payload, cancel), fields(size = payload.len()))]
    pub async fn append_member(
        &self,
        base_key: &str,
        name: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<AppendOutcome> {
        let guard = self.slots.acquire().await?;
        self.append_member_in(guard, base_key, name, payload, cancel)
            .await
    }

    /// Like [`append_member`](Self::append_member), failing with
    /// [`StorageError::SlotsExhausted`] instead of waiting.
    pub async fn try_append_member(
        &self,
        base_key: &str,
        name: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<AppendOutcome> {
        let guard = self.slots.try_acquire()?;
        self.append_member_in(guard, base_key, name, payload, cancel)
            .await
    }

    async fn append_member_in(
        &self,
        guard: SlotGuard,
        base_key: &str,
        name: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<AppendOutcome> {
        let key = Self::slot_key(base_key, guard.slot());
        let current = self.current_len(&key).await?;
        let lead = padding_len(current);
        let header = member_header(name, payload.len() as u64, now())?;

        let trailing = padding_len(payload.len() as u64);
        let mut buffer = BytesMut::with_capacity(
            lead as usize + header.len() + payload.len() + trailing as usize,
        );
        buffer.put_bytes(0, lead as usize);
        buffer.put_slice(&header);
        buffer.put_slice(&payload);
        buffer.put_bytes(0, trailing as usize);

        let len = self.rewrite(&key, current, buffer.freeze(), cancel).await?;
        tracing::debug!(key = %key, slot = guard.slot(), member = %name, len, "Appended archive member");

        Ok(AppendOutcome {
            key,
            slot: guard.slot(),
            offset: current + lead,
            len,
        })
    }

    /// Append the remote object `source_key` as a member named `name`.
    ///
    /// Objects at or above the chunk size are copied server-side and never
    /// pass through this process.
    #[instrument(skip(self, cancel))]
    pub async fn append_object(
        &self,
        base_key: &str,
        name: &str,
        source_key: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<AppendOutcome> {
        let size = self.store().head(source_key).await?.size;
        if !self.sessions.is_large(size) {
            let payload = self.store().get(source_key).await?;
            return self.append_member(base_key, name, payload, cancel).await;
        }

        let guard = self.slots.acquire().await?;
        let key = Self::slot_key(base_key, guard.slot());
        let current = self.current_len(&key).await?;
        let lead = padding_len(current);
        let header = member_header(name, size, now())?;
        let min_part = self.sessions.min_part_size();

        let plan = plan_reopen(current, self.sessions.chunk_size(), min_part);
        let mut session = self.sessions.initiate(&key, &self.options).await?;

        let result = async {
            self.copy_existing(&mut session, &key, &plan, cancel).await?;

            // Head part: carried tail, alignment, header and enough of the
            // source to satisfy the minimum part size.
            let mut head = BytesMut::new();
            if !plan.tail.is_empty() {
                head.put(self.store().get_range(&key, plan.tail.start, plan.tail.end).await?);
            }
            head.put_bytes(0, lead as usize);
            head.put_slice(&header);
            head.put(self.store().get_range(source_key, 0, min_part).await?);
            self.sessions.upload_next(&mut session, head.freeze()).await?;

            for range in copy_ranges(size - min_part, self.sessions.chunk_size(), min_part) {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let range = ByteRange::new(range.start + min_part, range.end + min_part);
                self.sessions.copy_next(&mut session, source_key, range).await?;
            }

            let trailing = padding_len(size);
            if trailing > 0 {
                self.sessions
                    .upload_next(&mut session, Bytes::from(vec![0u8; trailing as usize]))
                    .await?;
            }
            self.sessions.complete(&mut session).await
        }
        .await;
        self.sessions.finish(&mut session, result).await?;

        let len = current + lead + header.len() as u64 + size + padding_len(size);
        tracing::debug!(key = %key, slot = guard.slot(), member = %name, len, "Appended archive object");

        Ok(AppendOutcome {
            key,
            slot: guard.slot(),
            offset: current + lead,
            len,
        })
    }

    /// Align every slot object and terminate it with the end-of-archive marker.
    ///
    /// Waits for in-flight appends to release their slots. Returns the keys
    /// that were finished; slots that never received a member are skipped.
    #[instrument(skip(self, cancel))]
    pub async fn finish(&self, base_key: &str, cancel: &CancellationToken) -> StorageResult<Vec<String>> {
        let guards = self.slots.acquire_all().await?;
        let mut finished = Vec::new();

        for guard in &guards {
            let key = Self::slot_key(base_key, guard.slot());
            let current = self.current_len(&key).await?;
            if current == 0 {
                continue;
            }

            let lead = padding_len(current) as usize;
            let mut buffer = BytesMut::with_capacity(lead + 1024);
            buffer.put_bytes(0, lead);
            buffer.put_slice(&end_of_archive());

            self.rewrite(&key, current, buffer.freeze(), cancel).await?;
            finished.push(key);
        }

        Ok(finished)
    }

    /// Replace `key` (currently `current` bytes) with itself followed by `appended`.
    async fn rewrite(
        &self,
        key: &str,
        current: u64,
        appended: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        if current == 0 {
            return self.sessions.put(key, appended, &self.options, cancel).await;
        }
        if !self.store().supports_multipart() {
            let existing = self.store().get(key).await?;
            let mut whole = BytesMut::with_capacity(existing.len() + appended.len());
            whole.put(existing);
            whole.put(appended);
            return self.sessions.put(key, whole.freeze(), &self.options, cancel).await;
        }

        let plan = plan_reopen(current, self.sessions.chunk_size(), self.sessions.min_part_size());
        match self.reopen(key, &plan, appended.clone(), cancel).await {
            Err(StorageError::EntityTooSmall(reason)) if !plan.copies.is_empty() => {
                tracing::warn!(
                    key = %key,
                    reason = %reason,
                    "Copy part rejected as too small, re-uploading whole object"
                );
                let whole = ReopenPlan {
                    copies: Vec::new(),
                    tail: ByteRange::new(0, current),
                };
                self.reopen(key, &whole, appended.clone(), cancel).await?;
            }
            result => result?,
        }

        Ok(current + appended.len() as u64)
    }

    async fn reopen(
        &self,
        key: &str,
        plan: &ReopenPlan,
        appended: Bytes,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let mut session = self.sessions.initiate(key, &self.options).await?;

        let result = async {
            self.copy_existing(&mut session, key, plan, cancel).await?;

            let data = if plan.tail.is_empty() {
                appended
            } else {
                let tail = self.store().get_range(key, plan.tail.start, plan.tail.end).await?;
                let mut data = BytesMut::with_capacity(tail.len() + appended.len());
                data.put(tail);
                data.put(appended);
                data.freeze()
            };

            let chunk_size = self.sessions.chunk_size() as usize;
            let mut offset = 0;
            while offset < data.len() {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let end = (offset + chunk_size).min(data.len());
                self.sessions
                    .upload_next(&mut session, data.slice(offset..end))
                    .await?;
                offset = end;
            }

            self.sessions.complete(&mut session).await
        }
        .await;

        self.sessions.finish(&mut session, result).await
    }

    async fn copy_existing(
        &self,
        session: &mut MultipartSession,
        key: &str,
        plan: &ReopenPlan,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        for range in &plan.copies {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            self.sessions.copy_next(session, key, *range).await?;
        }
        Ok(())
    }
}

fn now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}
