//! Encryption mode selection and client-side envelope encryption.
//!
//! Server-side modes only add request parameters. Client-side mode wraps the
//! backend in an [`EnvelopeEncryptingStore`] that seals every object with a
//! fresh AES-256-GCM data key before it leaves the process.
//!
//! Sealed object layout:
//!
//! ```text
//! [magic "DPE1"][u16 BE wrapped key length][wrapped key][12-byte nonce][ciphertext + 16-byte tag]
//! ```

use crate::backends::s3::LazyDefaultCredentialsProvider;
use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ByteStream, CompletedPart, ListingOptions, ObjectMeta, ObjectStore, PageStream,
    PutOptions, ResponseOverrides, ServerSideEncryption,
};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use bytes::{BufMut, Bytes, BytesMut};
use depot_core::{EncryptionConfig, StorageConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

const MAGIC: &[u8; 4] = b"DPE1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Magic plus the wrapped key length field.
const PREFIX_LEN: usize = MAGIC.len() + 2;

/// Encryption applied to objects written through the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    None,
    /// Backend-managed AES-256.
    ServerManaged,
    ServerKms { key_id: String },
    ClientKms { key_id: String },
}

impl EncryptionMode {
    /// Resolve the mode. KMS modes without a key id are rejected.
    pub fn from_config(config: &EncryptionConfig) -> StorageResult<Self> {
        let key_id = |key_id: &Option<String>| {
            key_id
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    StorageError::InvalidConfiguration(
                        "KMS encryption requires a key id".to_string(),
                    )
                })
        };

        Ok(match config {
            EncryptionConfig::None => Self::None,
            EncryptionConfig::ServerManaged => Self::ServerManaged,
            EncryptionConfig::ServerKms { key_id: id } => Self::ServerKms { key_id: key_id(id)? },
            EncryptionConfig::ClientKms { key_id: id } => Self::ClientKms { key_id: key_id(id)? },
        })
    }

    /// Parameters sent with each write, if any.
    pub fn server_side(&self) -> Option<ServerSideEncryption> {
        match self {
            Self::ServerManaged => Some(ServerSideEncryption::Aes256),
            Self::ServerKms { key_id } => Some(ServerSideEncryption::Kms {
                key_id: key_id.clone(),
            }),
            Self::None | Self::ClientKms { .. } => None,
        }
    }

    pub fn is_client_side(&self) -> bool {
        matches!(self, Self::ClientKms { .. })
    }
}

/// A fresh data key and its wrapped form.
pub struct DataKey {
    pub plaintext: [u8; 32],
    pub wrapped: Vec<u8>,
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("plaintext", &"[REDACTED]")
            .field("wrapped_len", &self.wrapped.len())
            .finish()
    }
}

/// Source of data keys for envelope encryption.
#[async_trait]
pub trait DataKeyProvider: Send + Sync {
    async fn generate_data_key(&self) -> StorageResult<DataKey>;

    async fn decrypt_data_key(&self, wrapped: &[u8]) -> StorageResult<[u8; 32]>;

    fn key_id(&self) -> &str;
}

fn key_bytes(raw: &[u8]) -> StorageResult<[u8; 32]> {
    raw.try_into().map_err(|_| {
        StorageError::Encryption(format!("data key has wrong length: {} (expected 32)", raw.len()))
    })
}

/// Data keys generated and unwrapped by AWS KMS.
#[derive(Clone, Debug)]
pub struct KmsDataKeyProvider {
    client: aws_sdk_kms::Client,
    key_id: String,
}

impl KmsDataKeyProvider {
    pub fn new(client: aws_sdk_kms::Client, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }

    /// Build a KMS client with the same region and credentials as the storage backend.
    pub fn from_config(config: &StorageConfig, key_id: impl Into<String>) -> Self {
        let mut builder = aws_sdk_kms::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(
                aws_sdk_kms::config::retry::RetryConfig::standard()
                    .with_max_attempts(config.max_error_retry + 1),
            );

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder.credentials_provider(aws_sdk_kms::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "depot-config",
            ));
        } else {
            builder = builder.credentials_provider(LazyDefaultCredentialsProvider::new(
                config.region.clone(),
            ));
        }

        Self::new(aws_sdk_kms::Client::from_conf(builder.build()), key_id)
    }
}

#[async_trait]
impl DataKeyProvider for KmsDataKeyProvider {
    #[instrument(skip(self), fields(key_id = %self.key_id))]
    async fn generate_data_key(&self) -> StorageResult<DataKey> {
        let response = self
            .client
            .generate_data_key()
            .key_id(&self.key_id)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| StorageError::backend("kms_generate_data_key", &self.key_id, e))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| StorageError::Encryption("KMS returned no plaintext key".to_string()))?;
        let wrapped = response
            .ciphertext_blob()
            .ok_or_else(|| StorageError::Encryption("KMS returned no wrapped key".to_string()))?;

        Ok(DataKey {
            plaintext: key_bytes(plaintext.as_ref())?,
            wrapped: wrapped.as_ref().to_vec(),
        })
    }

    #[instrument(skip(self, wrapped), fields(key_id = %self.key_id))]
    async fn decrypt_data_key(&self, wrapped: &[u8]) -> StorageResult<[u8; 32]> {
        let response = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::backend("kms_decrypt", &self.key_id, e))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| StorageError::Encryption("KMS returned no plaintext key".to_string()))?;
        key_bytes(plaintext.as_ref())
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Data keys wrapped with a locally held master key.
pub struct LocalKeyProvider {
    key_id: String,
    master: Aes256Gcm,
}

impl LocalKeyProvider {
    pub fn new(key_id: impl Into<String>, master: [u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            master: Aes256Gcm::new(&Key::<Aes256Gcm>::from(master)),
        }
    }
}

impl std::fmt::Debug for LocalKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyProvider")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataKeyProvider for LocalKeyProvider {
    async fn generate_data_key(&self) -> StorageResult<DataKey> {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut plaintext = [0u8; 32];
        plaintext.copy_from_slice(&key);
        let wrapped = seal(&self.master, &plaintext)?;
        Ok(DataKey { plaintext, wrapped })
    }

    async fn decrypt_data_key(&self, wrapped: &[u8]) -> StorageResult<[u8; 32]> {
        key_bytes(&open(&self.master, wrapped)?)
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// `nonce || ciphertext` under `cipher`.
fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| StorageError::Encryption(format!("AES encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(cipher: &Aes256Gcm, sealed: &[u8]) -> StorageResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(StorageError::Encryption(
            "ciphertext too short to contain nonce and tag".to_string(),
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| {
            StorageError::Encryption(format!(
                "AES decryption failed (wrong key or tampered data): {e}"
            ))
        })
}

/// Length of the wrapped key declared by a sealed object's prefix.
fn wrapped_key_len(prefix: &[u8]) -> StorageResult<usize> {
    if prefix.len() < PREFIX_LEN || &prefix[..MAGIC.len()] != MAGIC {
        return Err(StorageError::Encryption(
            "object is not envelope encrypted".to_string(),
        ));
    }
    Ok(u16::from_be_bytes([prefix[4], prefix[5]]) as usize)
}

fn overhead(wrapped_len: usize) -> u64 {
    (PREFIX_LEN + wrapped_len + NONCE_LEN + TAG_LEN) as u64
}

/// Decorator that encrypts on write and decrypts on read.
///
/// Multipart uploads and presigned URLs are refused: parts cannot be sealed
/// independently, and a URL would hand out ciphertext. The store reports no
/// multipart support, so session managers write whole sealed objects instead.
pub struct EnvelopeEncryptingStore {
    inner: Arc<dyn ObjectStore>,
    keys: Arc<dyn DataKeyProvider>,
}

impl EnvelopeEncryptingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, keys: Arc<dyn DataKeyProvider>) -> Self {
        Self { inner, keys }
    }

    async fn seal_object(&self, data: &[u8]) -> StorageResult<Bytes> {
        let data_key = self.keys.generate_data_key().await?;
        let wrapped_len = u16::try_from(data_key.wrapped.len()).map_err(|_| {
            StorageError::Encryption("wrapped data key exceeds 65535 bytes".to_string())
        })?;

        let cipher = Aes256Gcm::new(&Key::<Aes256Gcm>::from(data_key.plaintext));
        let sealed = seal(&cipher, data)?;

        let mut out = BytesMut::with_capacity(PREFIX_LEN + data_key.wrapped.len() + sealed.len());
        out.put_slice(MAGIC);
        out.put_u16(wrapped_len);
        out.put_slice(&data_key.wrapped);
        out.put_slice(&sealed);
        Ok(out.freeze())
    }

    async fn open_object(&self, data: &[u8]) -> StorageResult<Bytes> {
        let wrapped_len = wrapped_key_len(data)?;
        if data.len() < PREFIX_LEN + wrapped_len {
            return Err(StorageError::Encryption("truncated envelope".to_string()));
        }
        let (wrapped, sealed) = data[PREFIX_LEN..].split_at(wrapped_len);

        let plaintext_key = self.keys.decrypt_data_key(wrapped).await?;
        let cipher = Aes256Gcm::new(&Key::<Aes256Gcm>::from(plaintext_key));
        Ok(Bytes::from(open(&cipher, sealed)?))
    }

    async fn get_plaintext(&self, key: &str) -> StorageResult<Bytes> {
        let sealed = self.inner.get(key).await?;
        self.open_object(&sealed).await
    }

    fn unsupported(operation: &str) -> StorageError {
        StorageError::Encryption(format!(
            "{operation} is not supported with client-side encryption"
        ))
    }
}

fn slice(key: &str, data: Bytes, start: u64, end: u64) -> StorageResult<Bytes> {
    let len = data.len() as u64;
    if end < start || start > len {
        return Err(StorageError::InvalidRange(format!(
            "range {start}..{end} is outside {key} ({len} bytes)"
        )));
    }
    Ok(data.slice(start as usize..end.min(len) as usize))
}

#[async_trait]
impl ObjectStore for EnvelopeEncryptingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let mut meta = self.inner.head(key).await?;
        let prefix = self.inner.get_range(key, 0, PREFIX_LEN as u64).await?;
        let wrapped_len = wrapped_key_len(&prefix)?;
        meta.size = meta.size.saturating_sub(overhead(wrapped_len));
        Ok(meta)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.get_plaintext(key).await
    }

    async fn get_stream(&self, key: &str, range: Option<ByteRange>) -> StorageResult<ByteStream> {
        let plaintext = self.get_plaintext(key).await?;
        let data = match range {
            Some(range) => slice(key, plaintext, range.start, range.end)?,
            None => plaintext,
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let plaintext = self.get_plaintext(key).await?;
        slice(key, plaintext, start, end)
    }

    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()> {
        let sealed = self.seal_object(&data).await?;
        let options = PutOptions {
            server_side_encryption: None,
            ..options.clone()
        };
        self.inner.put(key, sealed, &options).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn copy(&self, from: &str, to: &str, options: &PutOptions) -> StorageResult<()> {
        self.inner.copy(from, to, options).await
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        self.inner.list_pages(prefix, options)
    }

    async fn create_multipart(&self, _key: &str, _options: &PutOptions) -> StorageResult<String> {
        Err(Self::unsupported("multipart upload"))
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: u32,
        _data: Bytes,
    ) -> StorageResult<String> {
        Err(Self::unsupported("multipart upload"))
    }

    async fn upload_part_copy(
        &self,
        _key: &str,
        _upload_id: &str,
        _part_number: u32,
        _source: &str,
        _range: ByteRange,
    ) -> StorageResult<String> {
        Err(Self::unsupported("multipart copy"))
    }

    async fn complete_multipart(
        &self,
        _key: &str,
        _upload_id: &str,
        _parts: &[CompletedPart],
    ) -> StorageResult<()> {
        Err(Self::unsupported("multipart upload"))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.abort_multipart(key, upload_id).await
    }

    async fn presign_get(
        &self,
        _key: &str,
        _expires_in: Duration,
        _overrides: &ResponseOverrides,
    ) -> StorageResult<Url> {
        Err(Self::unsupported("presigned access"))
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    fn supports_multipart(&self) -> bool {
        false
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}

/// Chooses the client and server-side parameters for the configured mode.
#[derive(Clone)]
pub struct EncryptionSelector {
    mode: EncryptionMode,
    client: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for EncryptionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSelector")
            .field("mode", &self.mode)
            .field("backend", &self.client.backend_name())
            .finish()
    }
}

impl EncryptionSelector {
    /// Build a selector over `backend`. Client-side mode requires `keys`.
    pub fn new(
        mode: EncryptionMode,
        backend: Arc<dyn ObjectStore>,
        keys: Option<Arc<dyn DataKeyProvider>>,
    ) -> StorageResult<Self> {
        let client: Arc<dyn ObjectStore> = match (&mode, keys) {
            (EncryptionMode::ClientKms { .. }, Some(keys)) => {
                Arc::new(EnvelopeEncryptingStore::new(backend, keys))
            }
            (EncryptionMode::ClientKms { key_id }, None) => {
                return Err(StorageError::InvalidConfiguration(format!(
                    "client-side encryption with key {key_id} needs a data key provider"
                )));
            }
            (_, _) => backend,
        };

        tracing::debug!(mode = ?mode, "Encryption mode selected");
        Ok(Self { mode, client })
    }

    /// Build from configuration, creating a KMS key provider for client-side mode.
    pub fn from_config(config: &StorageConfig, backend: Arc<dyn ObjectStore>) -> StorageResult<Self> {
        let mode = EncryptionMode::from_config(&config.encryption)?;
        let keys: Option<Arc<dyn DataKeyProvider>> = match &mode {
            EncryptionMode::ClientKms { key_id } => {
                Some(Arc::new(KmsDataKeyProvider::from_config(config, key_id.clone())))
            }
            _ => None,
        };
        Self::new(mode, backend, keys)
    }

    pub fn mode(&self) -> &EncryptionMode {
        &self.mode
    }

    /// The client to use and the server-side parameters to attach to writes.
    pub fn client_for(&self) -> (Arc<dyn ObjectStore>, Option<ServerSideEncryption>) {
        (self.client.clone(), self.mode.server_side())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;

    fn client_store() -> (EnvelopeEncryptingStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::default());
        let keys = Arc::new(LocalKeyProvider::new("local", [7u8; 32]));
        (EnvelopeEncryptingStore::new(backend.clone(), keys), backend)
    }

    #[test]
    fn test_mode_from_config() {
        assert_eq!(
            EncryptionMode::from_config(&EncryptionConfig::None).unwrap(),
            EncryptionMode::None
        );
        let mode = EncryptionMode::from_config(&EncryptionConfig::ServerKms {
            key_id: Some("alias/depot".to_string()),
        })
        .unwrap();
        assert_eq!(
            mode.server_side(),
            Some(ServerSideEncryption::Kms {
                key_id: "alias/depot".to_string()
            })
        );

        let err = EncryptionMode::from_config(&EncryptionConfig::ClientKms { key_id: None })
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfiguration(_)));
        let err = EncryptionMode::from_config(&EncryptionConfig::ServerKms {
            key_id: Some("  ".to_string()),
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_selector_server_modes_pass_parameters() {
        let backend: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::default());
        let selector =
            EncryptionSelector::new(EncryptionMode::ServerManaged, backend.clone(), None).unwrap();
        let (client, sse) = selector.client_for();
        assert!(Arc::ptr_eq(&client, &backend));
        assert_eq!(sse, Some(ServerSideEncryption::Aes256));

        let selector = EncryptionSelector::new(EncryptionMode::None, backend, None).unwrap();
        assert_eq!(selector.client_for().1, None);
    }

    #[test]
    fn test_client_mode_requires_key_provider() {
        let backend: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::default());
        let err = EncryptionSelector::new(
            EncryptionMode::ClientKms {
                key_id: "k".to_string(),
            },
            backend,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_envelope_hides_plaintext_at_rest() {
        let (store, backend) = client_store();
        let payload = Bytes::from_static(b"quarterly numbers, do not share");
        store
            .put("k", payload.clone(), &PutOptions::default())
            .await
            .unwrap();

        let raw = backend.get("k").await.unwrap();
        assert_eq!(&raw[..4], MAGIC);
        assert!(!raw.windows(9).any(|w| w == b"quarterly"));

        assert_eq!(store.get("k").await.unwrap(), payload);
        assert_eq!(store.head("k").await.unwrap().size, payload.len() as u64);
        assert_eq!(store.get_range("k", 10, 17).await.unwrap(), "numbers");
    }

    #[tokio::test]
    async fn test_tampered_object_fails_to_decrypt() {
        let (store, backend) = client_store();
        store
            .put("k", Bytes::from_static(b"payload"), &PutOptions::default())
            .await
            .unwrap();

        let mut raw = backend.get("k").await.unwrap().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        backend
            .put("k", Bytes::from(raw), &PutOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            store.get("k").await.unwrap_err(),
            StorageError::Encryption(_)
        ));
    }

    #[tokio::test]
    async fn test_plain_object_is_rejected() {
        let (store, backend) = client_store();
        backend
            .put("plain", Bytes::from_static(b"hello"), &PutOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            store.get("plain").await.unwrap_err(),
            StorageError::Encryption(_)
        ));
    }

    #[tokio::test]
    async fn test_multipart_and_presign_are_refused() {
        let (store, _backend) = client_store();
        assert!(matches!(
            store
                .create_multipart("k", &PutOptions::default())
                .await
                .unwrap_err(),
            StorageError::Encryption(_)
        ));
        assert!(matches!(
            store
                .presign_get("k", Duration::from_secs(60), &ResponseOverrides::default())
                .await
                .unwrap_err(),
            StorageError::Encryption(_)
        ));
        assert!(!store.supports_multipart());
    }
}
