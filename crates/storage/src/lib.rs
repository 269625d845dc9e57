//! Tenant-scoped object storage engine for depot.
//!
//! This crate provides:
//! - The [`ObjectStore`] backend trait with S3 and in-memory implementations
//! - Quota-gated writes and deletes
//! - Multipart sessions for large uploads and server-side copies
//! - Direct presigned and CDN-signed access URLs
//! - Server-side and client-side (envelope) encryption
//! - Remote tar archives grown member by member through extension slots

pub mod archive;
pub mod backends;
pub mod encryption;
pub mod error;
pub mod multipart;
pub mod quota;
pub mod store;
pub mod traits;
pub mod urls;

pub use archive::{AppendOutcome, ArchiveAppendEngine, ExtensionSlotPool, SlotGuard};
pub use backends::{memory::MemoryBackend, s3::S3Backend};
pub use encryption::{
    DataKeyProvider, EncryptionMode, EncryptionSelector, EnvelopeEncryptingStore,
    KmsDataKeyProvider, LocalKeyProvider,
};
pub use error::{StorageError, StorageResult};
pub use multipart::{ChunkSessionManager, MultipartSession, SessionState};
pub use quota::{QuotaController, QuotaDelta, QuotaError, QuotaGate};
pub use store::{DataStore, PathStream, SaveOptions};
pub use traits::{
    ByteRange, ByteStream, CompletedPart, ListEntry, ListingOptions, ListingPage, ObjectMeta,
    ObjectStore, ObjectStoreListStreamExt, PutOptions, ResponseOverrides, ServerSideEncryption,
};
pub use urls::{AccessUrlIssuer, RequestContext};

use depot_core::{ModuleConfig, StorageConfig};
use std::sync::Arc;

/// Create the backend described by `config`.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config
        .validate()
        .map_err(StorageError::InvalidConfiguration)?;
    let backend = S3Backend::new(config).await?;
    Ok(Arc::new(backend))
}

/// Open a [`DataStore`] for `module` of `tenant` on the configured backend.
pub async fn open(
    config: &StorageConfig,
    module: &ModuleConfig,
    tenant: u64,
    quota: Option<Arc<dyn QuotaController>>,
) -> StorageResult<DataStore> {
    let backend = from_config(config).await?;
    DataStore::new(config, module, tenant, backend, quota)
}
