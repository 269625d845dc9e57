//! Tenant-scoped storage facade.
//!
//! A [`DataStore`] serves one `(tenant, module)` pair. It resolves logical
//! paths to backend keys, charges writes and deletes against the quota
//! ledger, picks the client for the configured encryption mode, and routes
//! large payloads through multipart sessions.

use crate::archive::{ArchiveAppendEngine, ExtensionSlotPool};
use crate::encryption::EncryptionSelector;
use crate::error::{StorageError, StorageResult};
use crate::multipart::{ChunkSessionManager, MultipartSession};
use crate::quota::{QuotaController, QuotaDelta, QuotaGate};
use crate::traits::{
    ByteRange, ByteStream, ListEntry, ObjectMeta, ObjectStore, ObjectStoreListStreamExt,
    PutOptions, ServerSideEncryption,
};
use crate::urls::{AccessUrlIssuer, RequestContext};
use bytes::Bytes;
use depot_core::policy::is_temp_domain;
use depot_core::{Acl, DomainPolicies, KeyResolver, ModuleConfig, StorageConfig};
use futures::{Stream, StreamExt, TryStreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

/// User metadata key recording the owner charged for an object.
pub const OWNER_METADATA_KEY: &str = "depot-owner";

/// User metadata key holding the unix time a private object expires.
pub const PRIVATE_EXPIRE_METADATA_KEY: &str = "depot-private-expire";

/// Content type used when a caller does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of archive slot objects.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

/// Archive slots per store unless configured otherwise.
pub const DEFAULT_ARCHIVE_SLOTS: u32 = 4;

/// A stream of paths relative to a listed directory.
pub type PathStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send + 'a>>;

/// Caller-supplied attributes for a saved object.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Acl,
}

impl SaveOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }
}

/// Storage for one tenant module.
pub struct DataStore {
    tenant: u64,
    module: String,
    resolver: KeyResolver,
    policies: Arc<DomainPolicies>,
    quota: QuotaGate,
    client: Arc<dyn ObjectStore>,
    sse: Option<ServerSideEncryption>,
    sessions: ChunkSessionManager,
    urls: AccessUrlIssuer,
    slots: ExtensionSlotPool,
    recycle_dir: Option<String>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("tenant", &self.tenant)
            .field("module", &self.module)
            .field("backend", &self.client.backend_name())
            .field("quota", &self.quota)
            .field("recycle_dir", &self.recycle_dir)
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Build a store over `backend`, selecting the encryption mode from `config`.
    pub fn new(
        config: &StorageConfig,
        module: &ModuleConfig,
        tenant: u64,
        backend: Arc<dyn ObjectStore>,
        quota: Option<Arc<dyn QuotaController>>,
    ) -> StorageResult<Self> {
        let encryption = EncryptionSelector::from_config(config, backend)?;
        Self::with_encryption(config, module, tenant, encryption, quota)
    }

    /// Build a store around an already constructed [`EncryptionSelector`].
    pub fn with_encryption(
        config: &StorageConfig,
        module: &ModuleConfig,
        tenant: u64,
        encryption: EncryptionSelector,
        quota: Option<Arc<dyn QuotaController>>,
    ) -> StorageResult<Self> {
        config.validate().map_err(StorageError::InvalidConfiguration)?;
        if module.name.trim().is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "module name is required".to_string(),
            ));
        }

        let policies = Arc::new(module.policies());
        let (client, sse) = encryption.client_for();
        let urls = AccessUrlIssuer::from_config(
            config,
            client.clone(),
            tenant,
            module.name.clone(),
            policies.clone(),
        )?;

        let recycle_dir = config
            .recycle_dir
            .as_deref()
            .map(|dir| dir.trim_matches('/').to_string())
            .filter(|dir| config.recycle_use && !dir.is_empty());

        tracing::debug!(
            tenant,
            module = %module.name,
            backend = client.backend_name(),
            mode = ?encryption.mode(),
            "Data store configured"
        );

        Ok(Self {
            tenant,
            module: module.name.clone(),
            resolver: config.key_resolver(),
            quota: QuotaGate::new(quota, module.name.clone(), policies.clone()),
            policies,
            sessions: ChunkSessionManager::new(
                client.clone(),
                config.chunk_size,
                config.min_part_size,
            ),
            client,
            sse,
            urls,
            slots: ExtensionSlotPool::new(DEFAULT_ARCHIVE_SLOTS),
            recycle_dir,
            cancel: CancellationToken::new(),
        })
    }

    /// Size the archive slot pool. Engines already handed out keep their pool.
    pub fn with_archive_slots(mut self, slots: u32) -> Self {
        self.slots = ExtensionSlotPool::new(slots.max(1));
        self
    }

    /// Replace the issuer, e.g. to route CDN URLs through a custom signer.
    pub fn with_url_issuer(mut self, urls: AccessUrlIssuer) -> Self {
        self.urls = urls;
        self
    }

    /// Cancel long copies and uploads when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn tenant(&self) -> u64 {
        self.tenant
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn policies(&self) -> &DomainPolicies {
        &self.policies
    }

    pub fn url_issuer(&self) -> &AccessUrlIssuer {
        &self.urls
    }

    /// Backend key for `path` in `domain`.
    pub fn resolve(&self, domain: &str, path: &str) -> String {
        self.resolver.resolve(self.tenant, &self.module, domain, path)
    }

    fn resolve_dir(&self, domain: &str, path: &str) -> String {
        self.resolver
            .resolve_dir(self.tenant, &self.module, domain, path)
    }

    fn put_options(&self, domain: &str, path: &str, owner: Uuid, options: &SaveOptions) -> PutOptions {
        let content_type = options
            .content_type
            .clone()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let content_disposition = match options
            .content_disposition
            .clone()
            .filter(|cd| !cd.trim().is_empty())
        {
            Some(disposition) => Some(disposition),
            None if self.policies.policy(domain).content_as_attachment => {
                Some(attachment_disposition(file_name(path)))
            }
            None if content_type == DEFAULT_CONTENT_TYPE => Some("attachment".to_string()),
            None => None,
        };

        let mut metadata = BTreeMap::new();
        if !owner.is_nil() {
            metadata.insert(OWNER_METADATA_KEY.to_string(), owner.to_string());
        }

        PutOptions {
            content_type: Some(content_type),
            content_disposition,
            content_encoding: options.content_encoding.clone(),
            cache_control: options.cache_control.clone(),
            acl: Some(self.policies.resolve_acl(domain, options.acl)),
            server_side_encryption: self.sse.clone(),
            metadata,
        }
    }

    /// Options for server-side copies into `domain`.
    fn copy_options(&self, domain: &str, source: &ObjectMeta) -> PutOptions {
        PutOptions {
            content_type: source.content_type.clone(),
            acl: Some(self.policies.resolve_acl(domain, Acl::Auto)),
            server_side_encryption: self.sse.clone(),
            metadata: source.metadata.clone(),
            ..PutOptions::default()
        }
    }

    /// Size of the object at `key`, zero when absent.
    async fn existing_size(&self, key: &str) -> StorageResult<u64> {
        match self.client.head(key).await {
            Ok(meta) => Ok(meta.size),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn entries_under(&self, prefix: &str) -> StorageResult<Vec<ListEntry>> {
        self.client.list_entries(prefix).try_collect().await
    }

    /// Save `data` and return the object's default URL.
    #[instrument(skip(self, data, options), fields(tenant = self.tenant, module = %self.module, size = data.len()))]
    pub async fn save(
        &self,
        domain: &str,
        path: &str,
        owner: Uuid,
        data: Bytes,
        options: &SaveOptions,
    ) -> StorageResult<Url> {
        let key = self.resolve(domain, path);
        let put = self.put_options(domain, path, owner, options);
        let replaced = self.existing_size(&key).await?;

        self.quota
            .write_replacing(domain, owner, data.len() as u64, replaced, || {
                self.sessions.put(&key, data, &put, &self.cancel)
            })
            .await?;

        self.committed_uri(domain, path).await
    }

    /// Save a stream of unknown length. `size_hint` is checked against quota up front.
    #[instrument(skip(self, stream, options), fields(tenant = self.tenant, module = %self.module))]
    pub async fn save_stream(
        &self,
        domain: &str,
        path: &str,
        owner: Uuid,
        stream: ByteStream,
        size_hint: u64,
        options: &SaveOptions,
    ) -> StorageResult<Url> {
        let key = self.resolve(domain, path);
        let put = self.put_options(domain, path, owner, options);
        let replaced = self.existing_size(&key).await?;

        self.quota
            .write_replacing(domain, owner, size_hint, replaced, || {
                self.sessions.put_stream(&key, stream, &put, &self.cancel)
            })
            .await?;

        self.committed_uri(domain, path).await
    }

    /// Save under a fresh random path. Returns the path and its URL.
    pub async fn save_temp(&self, domain: &str, data: Bytes) -> StorageResult<(String, Url)> {
        let path = Uuid::new_v4().to_string();
        let url = self
            .save(domain, &path, Uuid::nil(), data, &SaveOptions::default())
            .await?;
        Ok((path, url))
    }

    /// Read an object, optionally starting at `offset` and limited to `length` bytes.
    ///
    /// A zero `length` yields an empty stream once the object is known to exist.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn get_read_stream(
        &self,
        domain: &str,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> StorageResult<ByteStream> {
        let key = self.resolve(domain, path);
        let range = match length {
            Some(0) => {
                if !self.client.exists(&key).await? {
                    return Err(StorageError::NotFound(key));
                }
                return Ok(Box::pin(futures::stream::empty::<StorageResult<Bytes>>()));
            }
            Some(len) => Some(ByteRange::new(offset, offset.saturating_add(len))),
            None if offset > 0 => Some(ByteRange::from_offset(offset)),
            None => None,
        };
        self.client.get_stream(&key, range).await
    }

    /// Copy `key` into the recycle bin unless recycling is off or the domain is temporary.
    async fn recycle(&self, domain: &str, key: &str, meta: &ObjectMeta) -> StorageResult<()> {
        let Some(dir) = &self.recycle_dir else {
            return Ok(());
        };
        if is_temp_domain(domain) {
            return Ok(());
        }

        let target = format!("{dir}/{key}");
        tracing::debug!(key, target = %target, "Recycling object before delete");
        let options = PutOptions {
            content_type: meta.content_type.clone(),
            server_side_encryption: self.sse.clone(),
            metadata: meta.metadata.clone(),
            ..PutOptions::default()
        };
        self.sessions
            .copy(key, &target, meta.size, &options, &self.cancel)
            .await
    }

    /// Delete one object, refunding its size to the owner recorded at save time.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn delete(&self, domain: &str, path: &str) -> StorageResult<()> {
        let key = self.resolve(domain, path);
        let meta = self.client.head(&key).await?;
        let owner = owner_of(&meta);

        self.quota
            .delete(domain, owner, || async {
                self.recycle(domain, &key, &meta).await?;
                self.client.delete(&key).await?;
                Ok(meta.size)
            })
            .await?;
        Ok(())
    }

    /// Delete the listed paths, skipping missing ones. Returns the number deleted.
    #[instrument(skip(self, paths), fields(tenant = self.tenant, module = %self.module, count = paths.len()))]
    pub async fn delete_paths(&self, domain: &str, paths: &[String]) -> StorageResult<usize> {
        let mut by_owner: BTreeMap<Uuid, u64> = BTreeMap::new();
        let mut deleted = 0;

        for path in paths {
            let key = self.resolve(domain, path);
            let meta = match self.client.head(&key).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match self.client.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
            *by_owner.entry(owner_of(&meta)).or_default() += meta.size;
            deleted += 1;
        }

        for (owner, bytes) in by_owner {
            self.quota
                .apply(QuotaDelta {
                    domain: domain.to_string(),
                    owner_id: owner,
                    bytes: -(bytes as i64),
                })
                .await;
        }
        Ok(deleted)
    }

    /// Delete files under `path` whose name matches `pattern`.
    ///
    /// Files whose name starts with the quota controller's exclude pattern
    /// are removed without refunding quota. Returns the number deleted.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn delete_files(
        &self,
        domain: &str,
        path: &str,
        pattern: &str,
        recursive: bool,
        owner: Uuid,
    ) -> StorageResult<usize> {
        let prefix = self.resolve_dir(domain, path);
        let pattern = self.fold(pattern);
        let exclude = self
            .quota
            .controller()
            .and_then(|controller| controller.exclude_pattern())
            .map(|p| self.fold(p));

        let matches: Vec<ListEntry> = self
            .entries_under(&prefix)
            .await?
            .into_iter()
            .filter(|entry| {
                self.resolver
                    .relative_to(&prefix, &entry.key)
                    .is_some_and(|rel| accepts(rel, &pattern, recursive))
            })
            .collect();

        let count = matches.len();
        self.quota
            .delete(domain, owner, || async {
                let mut charged = 0;
                for entry in &matches {
                    let meta = self.client.head(&entry.key).await?;
                    self.recycle(domain, &entry.key, &meta).await?;
                    self.client.delete(&entry.key).await?;

                    let excluded = exclude
                        .as_deref()
                        .is_some_and(|p| !p.is_empty() && file_name(&entry.key).starts_with(p));
                    if !excluded {
                        charged += meta.size;
                    }
                }
                Ok(charged)
            })
            .await?;

        tracing::debug!(prefix = %prefix, count, "Deleted files by pattern");
        Ok(count)
    }

    /// Delete everything under `path`.
    pub async fn delete_directory(&self, domain: &str, path: &str, owner: Uuid) -> StorageResult<usize> {
        self.delete_files(domain, path, "*", true, owner).await
    }

    /// Recycle and delete `entries`, refunding each owner recorded at save time.
    async fn delete_entries(&self, domain: &str, entries: &[(ListEntry, ObjectMeta)]) -> StorageResult<usize> {
        let mut by_owner: BTreeMap<Uuid, u64> = BTreeMap::new();
        let mut deleted = 0;
        let mut result = Ok(());

        for (entry, meta) in entries {
            let removed = async {
                self.recycle(domain, &entry.key, meta).await?;
                self.client.delete(&entry.key).await
            }
            .await;
            match removed {
                Ok(()) => {
                    *by_owner.entry(owner_of(meta)).or_default() += meta.size;
                    deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        // Refund what was removed even when a later delete failed.
        for (owner, bytes) in by_owner {
            self.quota
                .apply(QuotaDelta {
                    domain: domain.to_string(),
                    owner_id: owner,
                    bytes: -(bytes as i64),
                })
                .await;
        }
        result.map(|()| deleted)
    }

    /// Delete files under `path` last modified within `[from, to]`.
    /// Returns the number deleted.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn delete_files_between(
        &self,
        domain: &str,
        path: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> StorageResult<usize> {
        let prefix = self.resolve_dir(domain, path);
        let mut doomed = Vec::new();
        for (entry, _) in self.files_under(&prefix).await? {
            let Some(modified) = entry.last_modified else {
                continue;
            };
            if modified < from || modified > to {
                continue;
            }
            let meta = match self.client.head(&entry.key).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            doomed.push((entry, meta));
        }

        let deleted = self.delete_entries(domain, &doomed).await?;
        tracing::debug!(prefix = %prefix, deleted, "Deleted files by modification time");
        Ok(deleted)
    }

    /// Delete expired files under `path`.
    ///
    /// Files saved with [`save_private`](Self::save_private) expire at their
    /// recorded instant. Other files expire once unmodified for longer than
    /// `old_threshold`. Returns the number deleted.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn delete_expired(&self, domain: &str, path: &str, old_threshold: Duration) -> StorageResult<usize> {
        let prefix = self.resolve_dir(domain, path);
        let now = OffsetDateTime::now_utc();
        let mut doomed = Vec::new();

        for (entry, _) in self.files_under(&prefix).await? {
            let meta = match self.client.head(&entry.key).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let expired = match private_expiry(&meta) {
                Some(expires) => now > expires,
                None => meta
                    .last_modified
                    .or(entry.last_modified)
                    .is_some_and(|modified| now - modified > old_threshold),
            };
            if expired {
                doomed.push((entry, meta));
            }
        }

        let deleted = self.delete_entries(domain, &doomed).await?;
        tracing::debug!(prefix = %prefix, deleted, "Deleted expired files");
        Ok(deleted)
    }

    /// Copy an object, charging the destination domain. Returns the copy's URL.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn copy_object(
        &self,
        src_domain: &str,
        src_path: &str,
        dst_domain: &str,
        dst_path: &str,
        owner: Uuid,
    ) -> StorageResult<Url> {
        let from = self.resolve(src_domain, src_path);
        let to = self.resolve(dst_domain, dst_path);
        self.duplicate(dst_domain, &from, &to, owner).await?;
        self.committed_uri(dst_domain, dst_path).await
    }

    /// Server-side copy of `from` to `to`, charging `owner` in `dst_domain`.
    async fn duplicate(&self, dst_domain: &str, from: &str, to: &str, owner: Uuid) -> StorageResult<u64> {
        let meta = self.client.head(from).await?;
        let mut options = self.copy_options(dst_domain, &meta);
        if !owner.is_nil() {
            options
                .metadata
                .insert(OWNER_METADATA_KEY.to_string(), owner.to_string());
        }
        let replaced = self.existing_size(to).await?;

        self.quota
            .write_replacing(dst_domain, owner, meta.size, replaced, || async {
                self.sessions
                    .copy(from, to, meta.size, &options, &self.cancel)
                    .await?;
                Ok(meta.size)
            })
            .await?;
        Ok(meta.size)
    }

    /// Move an object between paths or domains, transferring its quota charge.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn move_object(
        &self,
        src_domain: &str,
        src_path: &str,
        dst_domain: &str,
        dst_path: &str,
        owner: Uuid,
    ) -> StorageResult<Url> {
        let from = self.resolve(src_domain, src_path);
        let to = self.resolve(dst_domain, dst_path);
        if from != to {
            self.transfer(src_domain, &from, dst_domain, &to, owner).await?;
        }
        self.committed_uri(dst_domain, dst_path).await
    }

    /// Copy `from` to `to` and delete the source, moving its charge.
    ///
    /// A nil `owner` keeps the owner recorded on the source.
    async fn transfer(
        &self,
        src_domain: &str,
        from: &str,
        dst_domain: &str,
        to: &str,
        owner: Uuid,
    ) -> StorageResult<u64> {
        let meta = self.client.head(from).await?;
        let owner = if owner.is_nil() { owner_of(&meta) } else { owner };
        let options = self.copy_options(dst_domain, &meta);
        let replaced = self.existing_size(to).await?;

        // The owner's total does not grow, so no pre-check; both legs are
        // applied only after the backend confirms them.
        self.sessions
            .copy(from, to, meta.size, &options, &self.cancel)
            .await?;
        self.quota
            .apply(QuotaDelta {
                domain: dst_domain.to_string(),
                owner_id: owner,
                bytes: meta.size as i64 - replaced as i64,
            })
            .await;

        self.client.delete(from).await?;
        self.quota
            .apply(QuotaDelta {
                domain: src_domain.to_string(),
                owner_id: owner,
                bytes: -(meta.size as i64),
            })
            .await;
        Ok(meta.size)
    }

    /// Files under a directory as `(key, path relative to the directory)`.
    /// Directory markers are left out.
    async fn files_under(&self, prefix: &str) -> StorageResult<Vec<(ListEntry, String)>> {
        Ok(self
            .entries_under(prefix)
            .await?
            .into_iter()
            .filter(|entry| !entry.key.ends_with('/'))
            .filter_map(|entry| {
                let rel = self.resolver.relative_to(prefix, &entry.key)?.to_string();
                (!rel.is_empty()).then_some((entry, rel))
            })
            .collect())
    }

    /// Copy every file under `src_dir` to the same relative path under
    /// `dst_dir`, charging `owner` in the destination domain. Returns the
    /// number of files copied.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn copy_directory(
        &self,
        src_domain: &str,
        src_dir: &str,
        dst_domain: &str,
        dst_dir: &str,
        owner: Uuid,
    ) -> StorageResult<usize> {
        let files = self.files_under(&self.resolve_dir(src_domain, src_dir)).await?;
        for (entry, rel) in &files {
            let to = self.resolve(dst_domain, &join_path(dst_dir, rel));
            self.duplicate(dst_domain, &entry.key, &to, owner).await?;
        }
        tracing::debug!(count = files.len(), src_dir, dst_dir, "Copied directory");
        Ok(files.len())
    }

    /// Move every file under `src_dir` below `dst_dir`, transferring each
    /// charge. Returns the number of files moved.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn move_directory(
        &self,
        src_domain: &str,
        src_dir: &str,
        dst_domain: &str,
        dst_dir: &str,
        owner: Uuid,
    ) -> StorageResult<usize> {
        let files = self.files_under(&self.resolve_dir(src_domain, src_dir)).await?;
        let mut moved = 0;
        for (entry, rel) in &files {
            let to = self.resolve(dst_domain, &join_path(dst_dir, rel));
            if to == entry.key {
                continue;
            }
            self.transfer(src_domain, &entry.key, dst_domain, &to, owner).await?;
            moved += 1;
        }
        tracing::debug!(count = moved, src_dir, dst_dir, "Moved directory");
        Ok(moved)
    }

    /// Save `data` as a private attachment and return a URL signed until `expires`.
    ///
    /// The expiry is recorded on the object so [`delete_expired`](Self::delete_expired)
    /// can remove it later.
    #[instrument(skip(self, data), fields(tenant = self.tenant, module = %self.module, size = data.len()))]
    pub async fn save_private(
        &self,
        domain: &str,
        path: &str,
        data: Bytes,
        expires: OffsetDateTime,
    ) -> StorageResult<Url> {
        let lifetime = expires - OffsetDateTime::now_utc();
        if !lifetime.is_positive() {
            return Err(StorageError::InvalidExpiry(format!(
                "{expires} is not in the future"
            )));
        }
        let lifetime = Duration::try_from(lifetime)
            .map_err(|e| StorageError::InvalidExpiry(e.to_string()))?;

        let key = self.resolve(domain, path);
        let options = SaveOptions {
            content_disposition: Some("attachment".to_string()),
            acl: Acl::Private,
            ..SaveOptions::default()
        };
        let mut put = self.put_options(domain, path, Uuid::nil(), &options);
        put.metadata.insert(
            PRIVATE_EXPIRE_METADATA_KEY.to_string(),
            expires.unix_timestamp().to_string(),
        );
        let replaced = self.existing_size(&key).await?;

        self.quota
            .write_replacing(domain, Uuid::nil(), data.len() as u64, replaced, || {
                self.sessions.put(&key, data, &put, &self.cancel)
            })
            .await?;

        match self.urls.issue(domain, path, lifetime, &[], None).await {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::warn!(domain, path, error = %e, "Private URL unavailable after write, returning shared URL");
                self.urls.shared_url(domain, path, None)
            }
        }
    }

    /// Open a chunked upload for `path`.
    #[instrument(skip(self, options), fields(tenant = self.tenant, module = %self.module))]
    pub async fn initiate_chunked_upload(
        &self,
        domain: &str,
        path: &str,
        owner: Uuid,
        options: &SaveOptions,
    ) -> StorageResult<MultipartSession> {
        let key = self.resolve(domain, path);
        let put = self.put_options(domain, path, owner, options);
        self.sessions.initiate(&key, &put).await
    }

    /// Upload chunk `chunk_number` (1-based) and return its ETag.
    pub async fn upload_chunk(
        &self,
        session: &mut MultipartSession,
        chunk_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        self.sessions.upload_part(session, chunk_number, data).await
    }

    /// Complete a chunked upload and charge its final size.
    ///
    /// A quota rejection aborts the session.
    #[instrument(skip(self, session), fields(tenant = self.tenant, module = %self.module, upload_id = %session.upload_id()))]
    pub async fn finalize_chunked_upload(
        &self,
        domain: &str,
        path: &str,
        owner: Uuid,
        session: &mut MultipartSession,
    ) -> StorageResult<Url> {
        let key = session.key().to_string();
        let replaced = self.existing_size(&key).await?;
        let size_hint = session.bytes();

        let open = &mut *session;
        let result = self
            .quota
            .write_replacing(domain, owner, size_hint, replaced, move || async move {
                self.sessions.complete(open).await?;
                Ok(self.client.head(&key).await?.size)
            })
            .await;

        if let Err(e) = result {
            if !session.state().is_terminal() {
                self.sessions.abort_quietly(session).await;
            }
            return Err(e);
        }

        self.committed_uri(domain, path).await
    }

    /// Abort a chunked upload. Aborting twice is harmless.
    pub async fn abort_chunked_upload(&self, session: &mut MultipartSession) -> StorageResult<()> {
        self.sessions.abort(session).await
    }

    /// URL for an object the backend has already accepted.
    ///
    /// A write that went through is never reported as failed: when the
    /// signed URL cannot be issued the shared URL is returned instead.
    async fn committed_uri(&self, domain: &str, path: &str) -> StorageResult<Url> {
        match self.get_uri(domain, path).await {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::warn!(
                    domain,
                    path,
                    error = %e,
                    "Signed URL unavailable after write, returning shared URL"
                );
                self.urls.shared_url(domain, path, None)
            }
        }
    }

    /// Default URL for an object: signed with the domain expiry, or shared.
    pub async fn get_uri(&self, domain: &str, path: &str) -> StorageResult<Url> {
        self.urls
            .issue(domain, path, Duration::ZERO, &[], None)
            .await
    }

    /// Direct presigned URL. See [`AccessUrlIssuer::issue`].
    pub async fn get_presigned_uri(
        &self,
        domain: &str,
        path: &str,
        expiry: Duration,
        headers: &[String],
        request: Option<&RequestContext>,
    ) -> StorageResult<Url> {
        self.urls
            .issue(domain, path, expiry, headers, request)
            .await
    }

    /// CDN URL, or a direct one when no CDN is configured.
    pub async fn get_cdn_presigned_uri(
        &self,
        domain: &str,
        path: &str,
        expiry: Duration,
        headers: &[String],
        request: Option<&RequestContext>,
    ) -> StorageResult<Url> {
        self.urls
            .cdn_issue(domain, path, expiry, headers, request)
            .await
    }

    /// Files under `path` matching `pattern`, relative to `path`.
    ///
    /// The listing is lazy; re-invoking restarts it from the beginning.
    pub fn list_files_relative<'a>(
        &'a self,
        domain: &str,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> PathStream<'a> {
        let prefix = self.resolve_dir(domain, path);
        let pattern = self.fold(pattern);
        let mut entries = self.client.list_entries(&prefix);

        let stream = async_stream::try_stream! {
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let Some(rel) = self.resolver.relative_to(&prefix, &entry.key) else {
                    continue;
                };
                if accepts(rel, &pattern, recursive) {
                    yield rel.to_string();
                }
            }
        };

        Box::pin(stream)
    }

    /// Directories under `path`, relative to `path`.
    ///
    /// Directories are derived from object keys, plus explicit `/`-terminated
    /// markers. Each is yielded once.
    pub fn list_directories_relative<'a>(
        &'a self,
        domain: &str,
        path: &str,
        recursive: bool,
    ) -> PathStream<'a> {
        let prefix = self.resolve_dir(domain, path);
        let mut entries = self.client.list_entries(&prefix);

        let stream = async_stream::try_stream! {
            let mut seen = HashSet::new();
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let Some(rel) = self.resolver.relative_to(&prefix, &entry.key) else {
                    continue;
                };
                for dir in directories_of(rel, recursive) {
                    if seen.insert(dir.to_string()) {
                        yield dir.to_string();
                    }
                }
            }
        };

        Box::pin(stream)
    }

    pub async fn is_file(&self, domain: &str, path: &str) -> StorageResult<bool> {
        self.client.exists(&self.resolve(domain, path)).await
    }

    pub async fn is_directory(&self, domain: &str, path: &str) -> StorageResult<bool> {
        let prefix = self.resolve_dir(domain, path);
        let mut entries = self.client.list_entries(&prefix);
        match entries.next().await {
            Some(entry) => entry.map(|_| true),
            None => Ok(false),
        }
    }

    pub async fn get_file_size(&self, domain: &str, path: &str) -> StorageResult<u64> {
        Ok(self.client.head(&self.resolve(domain, path)).await?.size)
    }

    /// Total size under `path`. Fails with `NotFound` for an empty directory.
    pub async fn get_directory_size(&self, domain: &str, path: &str) -> StorageResult<u64> {
        let prefix = self.resolve_dir(domain, path);
        let entries = self.entries_under(&prefix).await?;
        if entries.is_empty() {
            return Err(StorageError::NotFound(prefix));
        }
        Ok(entries.iter().map(|entry| entry.size).sum())
    }

    pub async fn get_file_etag(&self, domain: &str, path: &str) -> StorageResult<String> {
        let meta = self.client.head(&self.resolve(domain, path)).await?;
        Ok(meta.etag.unwrap_or_default())
    }

    /// Bytes stored under `domain`, measured from the backend.
    pub async fn get_used_quota(&self, domain: &str) -> StorageResult<u64> {
        let prefix = self.resolve_dir(domain, "");
        Ok(self
            .entries_under(&prefix)
            .await?
            .iter()
            .map(|entry| entry.size)
            .sum())
    }

    /// Overwrite the ledger for `domain` with its measured size.
    #[instrument(skip(self), fields(tenant = self.tenant, module = %self.module))]
    pub async fn reset_quota(&self, domain: &str) -> StorageResult<u64> {
        let used = self.get_used_quota(domain).await?;
        self.quota.reset(domain, used).await?;
        tracing::info!(domain, used, "Quota ledger reset");
        Ok(used)
    }

    /// Engine appending archive members to objects in `domain`.
    ///
    /// Engines from the same store share one slot pool, so concurrent
    /// producers never hold the same slot key.
    pub fn archive_engine(&self, domain: &str) -> ArchiveAppendEngine {
        let options = PutOptions {
            content_type: Some(ARCHIVE_CONTENT_TYPE.to_string()),
            acl: Some(self.policies.resolve_acl(domain, Acl::Auto)),
            server_side_encryption: self.sse.clone(),
            ..PutOptions::default()
        };
        ArchiveAppendEngine::new(self.sessions.clone(), self.slots.clone(), options)
    }

    fn fold(&self, pattern: &str) -> String {
        if self.resolver.is_case_folding() {
            pattern.to_lowercase()
        } else {
            pattern.to_string()
        }
    }
}

/// Expiry recorded by [`DataStore::save_private`], if any.
fn private_expiry(meta: &ObjectMeta) -> Option<OffsetDateTime> {
    let seconds = meta.metadata.get(PRIVATE_EXPIRE_METADATA_KEY)?.parse().ok()?;
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

/// `rel` under `dir`, without doubled separators.
fn join_path(dir: &str, rel: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

fn owner_of(meta: &ObjectMeta) -> Uuid {
    meta.metadata
        .get(OWNER_METADATA_KEY)
        .and_then(|owner| Uuid::parse_str(owner).ok())
        .unwrap_or_else(Uuid::nil)
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// `Content-Disposition` naming `name`, RFC 5987-encoded when it is not plain ASCII.
fn attachment_disposition(name: &str) -> String {
    let plain = name
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | ';' | ','));
    if plain {
        format!("attachment; filename=\"{name}\"")
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        )
    }
}

/// Whether a listed relative path is a file matching `pattern`.
fn accepts(rel: &str, pattern: &str, recursive: bool) -> bool {
    if rel.is_empty() || rel.ends_with('/') {
        return false;
    }
    if !recursive && rel.contains('/') {
        return false;
    }
    wildcard_match(pattern, file_name(rel))
}

/// Directory prefixes of a relative key, outermost first.
fn directories_of(rel: &str, recursive: bool) -> Vec<&str> {
    let rel_dir = match rel.strip_suffix('/') {
        Some(marker) => marker,
        None => match rel.rfind('/') {
            Some(idx) => &rel[..idx],
            None => return Vec::new(),
        },
    };
    if rel_dir.is_empty() {
        return Vec::new();
    }

    let mut dirs: Vec<&str> = rel_dir
        .match_indices('/')
        .map(|(idx, _)| &rel_dir[..idx])
        .collect();
    dirs.push(rel_dir);

    if recursive {
        dirs
    } else {
        dirs.truncate(1);
        dirs
    }
}

/// Glob match supporting `*` and `?`. An empty pattern, `*` and `*.*` match every name.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() || pattern == "*" || pattern == "*.*" {
        return true;
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::quota::QuotaError;
    use async_trait::async_trait;
    use depot_core::DomainConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Ledger {
        used: Mutex<HashMap<(String, Uuid), i64>>,
        limit: Option<u64>,
    }

    impl Ledger {
        fn total(&self) -> i64 {
            self.used.lock().values().sum()
        }

        fn of(&self, domain: &str, owner: Uuid) -> i64 {
            self.used
                .lock()
                .get(&(domain.to_string(), owner))
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl QuotaController for Ledger {
        async fn quota_used_check(&self, bytes: u64, owner: Uuid) -> Result<(), QuotaError> {
            let used: i64 = self
                .used
                .lock()
                .iter()
                .filter(|((_, o), _)| *o == owner)
                .map(|(_, v)| *v)
                .sum();
            match self.limit {
                Some(limit) if used as u64 + bytes > limit => Err(QuotaError::Exceeded),
                _ => Ok(()),
            }
        }

        async fn quota_used_add(
            &self,
            _module: &str,
            domain: &str,
            bytes: u64,
            owner: Uuid,
        ) -> Result<(), QuotaError> {
            *self
                .used
                .lock()
                .entry((domain.to_string(), owner))
                .or_default() += bytes as i64;
            Ok(())
        }

        async fn quota_used_delete(
            &self,
            _module: &str,
            domain: &str,
            bytes: u64,
            owner: Uuid,
        ) -> Result<(), QuotaError> {
            *self
                .used
                .lock()
                .entry((domain.to_string(), owner))
                .or_default() -= bytes as i64;
            Ok(())
        }

        async fn quota_used_set(
            &self,
            _module: &str,
            domain: &str,
            bytes: u64,
        ) -> Result<(), QuotaError> {
            let mut used = self.used.lock();
            used.retain(|(d, _), _| d != domain);
            used.insert((domain.to_string(), Uuid::nil()), bytes as i64);
            Ok(())
        }

        fn exclude_pattern(&self) -> Option<&str> {
            Some("thumb_")
        }
    }

    fn config() -> StorageConfig {
        StorageConfig {
            bucket: "docs".to_string(),
            chunk_size: 2048,
            min_part_size: 512,
            ..StorageConfig::default()
        }
    }

    fn module() -> ModuleConfig {
        ModuleConfig {
            name: "files".to_string(),
            domains: vec![DomainConfig {
                name: "signed".to_string(),
                acl: None,
                expires_secs: Some(300),
                content_as_attachment: Some(true),
                quota_exempt: false,
            }],
            ..ModuleConfig::default()
        }
    }

    fn store_with(config: StorageConfig, limit: Option<u64>) -> (DataStore, Arc<MemoryBackend>, Arc<Ledger>) {
        let backend = Arc::new(MemoryBackend::new(config.min_part_size));
        let ledger = Arc::new(Ledger {
            limit,
            ..Ledger::default()
        });
        let store = DataStore::new(&config, &module(), 7, backend.clone(), Some(ledger.clone()))
            .unwrap();
        (store, backend, ledger)
    }

    fn store() -> (DataStore, Arc<MemoryBackend>, Arc<Ledger>) {
        store_with(config(), None)
    }

    async fn read_all(store: &DataStore, domain: &str, path: &str) -> Vec<u8> {
        let stream = store.get_read_stream(domain, path, 0, None).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*.*", "noext"));
        assert!(wildcard_match("*.txt", "notes.txt"));
        assert!(!wildcard_match("*.txt", "notes.txt.bak"));
        assert!(wildcard_match("a?c*", "abcdef"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(wildcard_match("*b*b*", "abxxbyy"));
        assert!(!wildcard_match("thumb_*", "photo.jpg"));
    }

    #[test]
    fn test_directories_of() {
        assert_eq!(directories_of("a/b/c.txt", true), vec!["a", "a/b"]);
        assert_eq!(directories_of("a/b/c.txt", false), vec!["a"]);
        assert_eq!(directories_of("c.txt", true), Vec::<&str>::new());
        assert_eq!(directories_of("a/b/", true), vec!["a", "a/b"]);
    }

    #[test]
    fn test_attachment_disposition() {
        assert_eq!(
            attachment_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            attachment_disposition("отчёт.pdf"),
            "attachment; filename*=UTF-8''%D0%BE%D1%82%D1%87%D1%91%D1%82%2Epdf"
        );
    }

    #[tokio::test]
    async fn test_save_applies_defaults_and_charges_owner() {
        let (store, backend, ledger) = store();
        let owner = Uuid::new_v4();

        let url = store
            .save("room", "Docs/A.bin", owner, Bytes::from(vec![1u8; 100]), &SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(url.path(), "/docs/7/files/room/docs/a.bin");

        let options = backend.object_options("7/files/room/docs/a.bin").unwrap();
        assert_eq!(options.content_type.as_deref(), Some(DEFAULT_CONTENT_TYPE));
        assert_eq!(options.content_disposition.as_deref(), Some("attachment"));
        assert_eq!(options.acl, Some(Acl::Public));
        assert_eq!(
            options.metadata.get(OWNER_METADATA_KEY),
            Some(&owner.to_string())
        );
        assert_eq!(ledger.of("room", owner), 100);
    }

    #[tokio::test]
    async fn test_save_in_signed_domain_is_private_attachment() {
        let (store, backend, _) = store();
        let url = store
            .save(
                "signed",
                "a/report.pdf",
                Uuid::nil(),
                Bytes::from_static(b"%PDF"),
                &SaveOptions::with_content_type("application/pdf"),
            )
            .await
            .unwrap();
        assert!(url.query().unwrap_or_default().contains("X-Expires=300"));

        let options = backend
            .object_options("7/files/signed/a/report.pdf")
            .unwrap();
        assert_eq!(options.acl, Some(Acl::Private));
        assert_eq!(
            options.content_disposition.as_deref(),
            Some("attachment; filename=\"report.pdf\"")
        );
    }

    #[tokio::test]
    async fn test_overwrite_charges_only_the_difference() {
        let (store, _, ledger) = store();
        let owner = Uuid::new_v4();
        let opts = SaveOptions::default();
        store
            .save("room", "f", owner, Bytes::from(vec![0u8; 300]), &opts)
            .await
            .unwrap();
        store
            .save("room", "f", owner, Bytes::from(vec![0u8; 120]), &opts)
            .await
            .unwrap();
        assert_eq!(ledger.of("room", owner), 120);
    }

    #[tokio::test]
    async fn test_save_rejected_by_quota_writes_nothing() {
        let (store, backend, ledger) = store_with(config(), Some(50));
        let err = store
            .save("room", "big", Uuid::new_v4(), Bytes::from(vec![0u8; 51]), &SaveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { requested: 51 }));
        assert_eq!(backend.stored_bytes(), 0);
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_large_save_goes_multipart() {
        let (store, backend, ledger) = store();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        store
            .save("room", "big.bin", Uuid::nil(), Bytes::from(data.clone()), &SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(read_all(&store, "room", "big.bin").await, data);
        assert_eq!(backend.pending_uploads(), 0);
        assert_eq!(ledger.of("room", Uuid::nil()), 5000);
    }

    #[tokio::test]
    async fn test_read_stream_ranges() {
        let (store, _, _) = store();
        store
            .save("room", "r", Uuid::nil(), Bytes::from_static(b"0123456789"), &SaveOptions::default())
            .await
            .unwrap();

        let read = |offset, length| {
            let store = &store;
            async move {
                let stream = store.get_read_stream("room", "r", offset, length).await.unwrap();
                let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
                chunks.concat()
            }
        };
        assert_eq!(read(0, None).await, b"0123456789");
        assert_eq!(read(4, None).await, b"456789");
        assert_eq!(read(2, Some(3)).await, b"234");
        assert_eq!(read(8, Some(100)).await, b"89");
        assert!(read(3, Some(0)).await.is_empty());

        let err = store
            .get_read_stream("room", "missing", 0, Some(0))
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_refunds_recorded_owner() {
        let (store, backend, ledger) = store();
        let owner = Uuid::new_v4();
        store
            .save("room", "f", owner, Bytes::from(vec![0u8; 64]), &SaveOptions::default())
            .await
            .unwrap();
        store.delete("room", "f").await.unwrap();

        assert_eq!(ledger.of("room", owner), 0);
        assert_eq!(backend.stored_bytes(), 0);
        assert!(store.delete("room", "f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_copies_to_recycle_bin() {
        let config = StorageConfig {
            recycle_dir: Some("/recycle/".to_string()),
            recycle_use: true,
            ..config()
        };
        let (store, backend, _) = store_with(config, None);
        let opts = SaveOptions::default();
        store
            .save("room", "keep.txt", Uuid::nil(), Bytes::from_static(b"k"), &opts)
            .await
            .unwrap();
        store
            .save("room_temp", "tmp.txt", Uuid::nil(), Bytes::from_static(b"t"), &opts)
            .await
            .unwrap();

        store.delete("room", "keep.txt").await.unwrap();
        store.delete("room_temp", "tmp.txt").await.unwrap();

        assert!(backend.exists("recycle/7/files/room/keep.txt").await.unwrap());
        assert!(!backend.exists("recycle/7/files/room_temp/tmp.txt").await.unwrap());
        assert!(!store.is_file("room", "keep.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_files_by_pattern() {
        let (store, _, ledger) = store();
        let owner = Uuid::new_v4();
        let opts = SaveOptions::default();
        for (path, size) in [
            ("d/a.txt", 10),
            ("d/b.log", 20),
            ("d/thumb_a.txt", 30),
            ("d/sub/c.txt", 40),
        ] {
            store
                .save("room", path, owner, Bytes::from(vec![0u8; size]), &opts)
                .await
                .unwrap();
        }

        let deleted = store
            .delete_files("room", "d", "*.txt", false, owner)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.is_file("room", "d/b.log").await.unwrap());
        assert!(store.is_file("room", "d/sub/c.txt").await.unwrap());
        // thumb_ files are excluded from the refund.
        assert_eq!(ledger.of("room", owner), 100 - 10);

        let deleted = store.delete_directory("room", "d", owner).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!store.is_directory("room", "d").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_paths_skips_missing() {
        let (store, _, ledger) = store();
        let owner = Uuid::new_v4();
        store
            .save("room", "x", owner, Bytes::from(vec![0u8; 8]), &SaveOptions::default())
            .await
            .unwrap();
        let deleted = store
            .delete_paths("room", &["x".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ledger.of("room", owner), 0);
    }

    #[tokio::test]
    async fn test_move_transfers_charge_between_domains() {
        let (store, _, ledger) = store_with(config(), Some(100));
        let owner = Uuid::new_v4();
        store
            .save("room", "f", owner, Bytes::from(vec![0u8; 100]), &SaveOptions::default())
            .await
            .unwrap();

        // The ledger is full, but a move does not grow it.
        store
            .move_object("room", "f", "archive", "g", owner)
            .await
            .unwrap();

        assert!(!store.is_file("room", "f").await.unwrap());
        assert!(store.is_file("archive", "g").await.unwrap());
        assert_eq!(ledger.of("room", owner), 0);
        assert_eq!(ledger.of("archive", owner), 100);
    }

    #[tokio::test]
    async fn test_copy_charges_destination() {
        let (store, _, ledger) = store();
        let owner = Uuid::new_v4();
        store
            .save("room", "f", owner, Bytes::from_static(b"abc"), &SaveOptions::default())
            .await
            .unwrap();
        store
            .copy_object("room", "f", "backup", "f", owner)
            .await
            .unwrap();
        assert_eq!(read_all(&store, "backup", "f").await, b"abc");
        assert_eq!(ledger.of("room", owner), 3);
        assert_eq!(ledger.of("backup", owner), 3);
    }

    async fn save_tree(store: &DataStore, owner: Uuid) {
        for (path, len) in [("docs/a.txt", 10usize), ("docs/sub/b.txt", 20), ("other/c.txt", 5)] {
            store
                .save("room", path, owner, Bytes::from(vec![1u8; len]), &SaveOptions::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_copy_directory_charges_each_file() {
        let (store, _, ledger) = store();
        let owner = Uuid::new_v4();
        save_tree(&store, owner).await;

        let copied = store
            .copy_directory("room", "docs", "backup", "saved/docs", owner)
            .await
            .unwrap();
        assert_eq!(copied, 2);
        assert_eq!(read_all(&store, "backup", "saved/docs/sub/b.txt").await, vec![1u8; 20]);
        assert!(!store.is_file("backup", "saved/docs/c.txt").await.unwrap());
        assert_eq!(ledger.of("room", owner), 35);
        assert_eq!(ledger.of("backup", owner), 30);

        // Copying again replaces the files without charging twice.
        store
            .copy_directory("room", "docs", "backup", "saved/docs", owner)
            .await
            .unwrap();
        assert_eq!(ledger.of("backup", owner), 30);
    }

    #[tokio::test]
    async fn test_move_directory_transfers_recorded_owner() {
        let (store, _, ledger) = store_with(config(), Some(35));
        let owner = Uuid::new_v4();
        save_tree(&store, owner).await;

        let moved = store
            .move_directory("room", "docs", "archive", "2024", Uuid::nil())
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert!(!store.is_directory("room", "docs").await.unwrap());
        assert!(store.is_file("archive", "2024/a.txt").await.unwrap());
        assert!(store.is_file("archive", "2024/sub/b.txt").await.unwrap());
        assert_eq!(ledger.of("room", owner), 5);
        assert_eq!(ledger.of("archive", owner), 30);
        assert_eq!(ledger.total(), 35);
    }

    #[tokio::test]
    async fn test_delete_files_between_uses_modification_time() {
        let (store, backend, ledger) = store();
        let owner = Uuid::new_v4();
        save_tree(&store, owner).await;

        let now = OffsetDateTime::now_utc();
        let old = now - time::Duration::days(10);
        assert!(backend.touch(&store.resolve("room", "docs/a.txt"), old));
        assert!(backend.touch(&store.resolve("room", "other/c.txt"), old));

        let deleted = store
            .delete_files_between("room", "docs", old - time::Duration::days(1), now - time::Duration::days(5))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.is_file("room", "docs/a.txt").await.unwrap());
        assert!(store.is_file("room", "docs/sub/b.txt").await.unwrap());
        assert!(store.is_file("room", "other/c.txt").await.unwrap());
        assert_eq!(ledger.of("room", owner), 25);
    }

    #[tokio::test]
    async fn test_save_private_records_expiry() {
        let (store, backend, ledger) = store();
        let expires = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let url = store
            .save_private("room", "tmp/export.zip", Bytes::from_static(b"zip"), expires)
            .await
            .unwrap();
        assert!(url.query().is_some_and(|q| q.contains("X-Expires")));

        let options = backend
            .object_options(&store.resolve("room", "tmp/export.zip"))
            .unwrap();
        assert_eq!(options.acl, Some(Acl::Private));
        assert_eq!(options.content_disposition.as_deref(), Some("attachment"));
        assert_eq!(
            options.metadata.get(PRIVATE_EXPIRE_METADATA_KEY),
            Some(&expires.unix_timestamp().to_string())
        );
        assert_eq!(ledger.of("room", Uuid::nil()), 3);

        let err = store
            .save_private("room", "late", Bytes::from_static(b"x"), OffsetDateTime::now_utc() - time::Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidExpiry(_)));
        assert!(!store.is_file("room", "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (store, backend, ledger) = store();
        let owner = Uuid::new_v4();
        let soon = OffsetDateTime::now_utc() + time::Duration::seconds(2);
        store
            .save_private("room", "tmp/expiring", Bytes::from_static(b"abcd"), soon)
            .await
            .unwrap();
        store
            .save_private("room", "tmp/fresh", Bytes::from_static(b"ab"), soon + time::Duration::days(1))
            .await
            .unwrap();
        store
            .save("room", "tmp/stale", owner, Bytes::from_static(b"abc"), &SaveOptions::default())
            .await
            .unwrap();
        store
            .save("room", "tmp/recent", owner, Bytes::from_static(b"abc"), &SaveOptions::default())
            .await
            .unwrap();

        let key = store.resolve("room", "tmp/expiring");
        let mut meta = backend.head(&key).await.unwrap();
        meta.metadata.insert(
            PRIVATE_EXPIRE_METADATA_KEY.to_string(),
            (OffsetDateTime::now_utc() - time::Duration::minutes(1)).unix_timestamp().to_string(),
        );
        let mut put = backend.object_options(&key).unwrap();
        put.metadata = meta.metadata;
        backend.put(&key, Bytes::from_static(b"abcd"), &put).await.unwrap();
        // Recorded expiry wins over modification time.
        backend.touch(&store.resolve("room", "tmp/fresh"), OffsetDateTime::now_utc() - time::Duration::days(30));
        backend.touch(&store.resolve("room", "tmp/stale"), OffsetDateTime::now_utc() - time::Duration::days(30));

        let deleted = store
            .delete_expired("room", "tmp", Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(!store.is_file("room", "tmp/expiring").await.unwrap());
        assert!(!store.is_file("room", "tmp/stale").await.unwrap());
        assert!(store.is_file("room", "tmp/fresh").await.unwrap());
        assert!(store.is_file("room", "tmp/recent").await.unwrap());
        assert_eq!(ledger.of("room", Uuid::nil()), 2);
        assert_eq!(ledger.of("room", owner), 3);
    }

    #[tokio::test]
    async fn test_chunked_upload_lifecycle() {
        let (store, backend, ledger) = store();
        let owner = Uuid::new_v4();
        let mut session = store
            .initiate_chunked_upload("room", "up.bin", owner, &SaveOptions::default())
            .await
            .unwrap();
        store
            .upload_chunk(&mut session, 1, Bytes::from(vec![1u8; 600]))
            .await
            .unwrap();
        store
            .upload_chunk(&mut session, 2, Bytes::from(vec![2u8; 10]))
            .await
            .unwrap();
        store
            .finalize_chunked_upload("room", "up.bin", owner, &mut session)
            .await
            .unwrap();

        assert_eq!(store.get_file_size("room", "up.bin").await.unwrap(), 610);
        assert_eq!(ledger.of("room", owner), 610);
        assert_eq!(backend.pending_uploads(), 0);
        store.abort_chunked_upload(&mut session).await.unwrap_err();
    }

    #[tokio::test]
    async fn test_finalize_over_quota_aborts_session() {
        let (store, backend, ledger) = store_with(config(), Some(100));
        let owner = Uuid::new_v4();
        let mut session = store
            .initiate_chunked_upload("room", "up.bin", owner, &SaveOptions::default())
            .await
            .unwrap();
        store
            .upload_chunk(&mut session, 1, Bytes::from(vec![0u8; 200]))
            .await
            .unwrap();

        let err = store
            .finalize_chunked_upload("room", "up.bin", owner, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(backend.pending_uploads(), 0);
        assert!(!store.is_file("room", "up.bin").await.unwrap());
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_listing_relative_paths() {
        let (store, _, _) = store();
        let opts = SaveOptions::default();
        for path in ["top/a.txt", "top/b.png", "top/x/c.txt", "top/x/y/d.txt", "other/e.txt"] {
            store
                .save("room", path, Uuid::nil(), Bytes::from_static(b"."), &opts)
                .await
                .unwrap();
        }

        let files: Vec<String> = store
            .list_files_relative("room", "top", "*.TXT", true)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(files, vec!["a.txt", "x/c.txt", "x/y/d.txt"]);

        let files: Vec<String> = store
            .list_files_relative("room", "top", "*", false)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(files, vec!["a.txt", "b.png"]);

        let dirs: Vec<String> = store
            .list_directories_relative("room", "top", true)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(dirs, vec!["x", "x/y"]);

        let dirs: Vec<String> = store
            .list_directories_relative("room", "", false)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(dirs, vec!["other", "top"]);
    }

    #[tokio::test]
    async fn test_sizes_and_quota_reset() {
        let (store, _, ledger) = store();
        let opts = SaveOptions::default();
        store
            .save("room", "d/a", Uuid::nil(), Bytes::from(vec![0u8; 5]), &opts)
            .await
            .unwrap();
        store
            .save("room", "d/b", Uuid::nil(), Bytes::from(vec![0u8; 7]), &opts)
            .await
            .unwrap();

        assert_eq!(store.get_directory_size("room", "d").await.unwrap(), 12);
        assert!(
            store
                .get_directory_size("room", "empty")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(!store.get_file_etag("room", "d/a").await.unwrap().is_empty());
        assert_eq!(store.get_used_quota("room").await.unwrap(), 12);

        ledger.quota_used_add("files", "room", 1000, Uuid::nil()).await.unwrap();
        assert_eq!(store.reset_quota("room").await.unwrap(), 12);
        assert_eq!(ledger.of("room", Uuid::nil()), 12);
    }

    #[tokio::test]
    async fn test_save_temp_uses_random_path() {
        let (store, _, ledger) = store();
        let (path, _) = store
            .save_temp("room_temp", Bytes::from_static(b"tmp"))
            .await
            .unwrap();
        assert!(Uuid::parse_str(&path).is_ok());
        assert!(store.is_file("room_temp", &path).await.unwrap());
        assert_eq!(ledger.total(), 0);
    }

    #[tokio::test]
    async fn test_archive_engine_shares_slots() {
        let (store, backend, ledger) = store();
        let store = store.with_archive_slots(2);
        let base = store.resolve("backup", "export.tar");

        let first = store.archive_engine("backup");
        let second = store.archive_engine("backup");
        let _held = first.slots().try_acquire().unwrap();
        let _held_too = second.slots().try_acquire().unwrap();
        assert!(matches!(
            first.slots().try_acquire().unwrap_err(),
            StorageError::SlotsExhausted
        ));
        drop((_held, _held_too));

        let outcome = first
            .append_member(&base, "a.txt", Bytes::from_static(b"0123456789"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.len, 1024);
        let options = backend.object_options(&outcome.key).unwrap();
        assert_eq!(options.content_type.as_deref(), Some(ARCHIVE_CONTENT_TYPE));
        assert_eq!(ledger.total(), 0);
    }
}
