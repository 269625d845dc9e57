//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ByteStream, CompletedPart, ListEntry, ListingOptions, ListingPage, ObjectMeta,
    ObjectStore, PageStream, PutOptions, ResponseOverrides, ServerSideEncryption,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{DateTime, DateTimeFormat};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, ObjectCannedAcl, ServerSideEncryption as SseAlgorithm,
};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use depot_core::{Acl, StorageConfig};
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use url::Url;

/// Maximum range size for get_range operations (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Marker included in lazy-credentials errors so they surface as configuration
/// errors instead of generic transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "depot-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "depot-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
#[derive(Debug)]
pub(crate) struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    pub(crate) fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Map an SDK error to a storage error.
///
/// Missing keys and buckets become `NotFound`, an undersized part becomes
/// `EntityTooSmall`, and everything else keeps the operation and key for context.
fn map_sdk_error<E>(err: SdkError<E>, operation: &'static str, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let err_text = format!("{err:?}");
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::InvalidConfiguration(
            "S3 credential initialization failed. Configure credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }

    match err.code() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => {
            return StorageError::NotFound(key.to_string());
        }
        Some("EntityTooSmall") => return StorageError::EntityTooSmall(key.to_string()),
        _ => {}
    }

    if let SdkError::ServiceError(ref service_err) = err
        && service_err.raw().status().as_u16() == 404
    {
        return StorageError::NotFound(key.to_string());
    }

    StorageError::backend(operation, key, err)
}

/// Like [`map_sdk_error`], but a vanished upload becomes `SessionExpired`.
fn map_multipart_error<E>(
    err: SdkError<E>,
    operation: &'static str,
    key: &str,
    upload_id: &str,
) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if err.code() == Some("NoSuchUpload") {
        return StorageError::SessionExpired {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        };
    }
    map_sdk_error(err, operation, key)
}

fn canned_acl(acl: Option<Acl>) -> Option<ObjectCannedAcl> {
    match acl {
        Some(Acl::Public) => Some(ObjectCannedAcl::PublicRead),
        Some(Acl::Private) => Some(ObjectCannedAcl::Private),
        Some(Acl::Auto) | None => None,
    }
}

fn sse_params(sse: &Option<ServerSideEncryption>) -> (Option<SseAlgorithm>, Option<String>) {
    match sse {
        Some(ServerSideEncryption::Aes256) => (Some(SseAlgorithm::Aes256), None),
        Some(ServerSideEncryption::Kms { key_id }) => {
            (Some(SseAlgorithm::AwsKms), Some(key_id.clone()))
        }
        None => (None, None),
    }
}

fn user_metadata(options: &PutOptions) -> Option<HashMap<String, String>> {
    if options.metadata.is_empty() {
        None
    } else {
        Some(
            options
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn to_offset_datetime(key: &str, dt: &DateTime) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.secs())
        .inspect_err(|e| {
            tracing::warn!(
                key = %key,
                timestamp = dt.secs(),
                error = %e,
                "Failed to convert S3 timestamp"
            );
        })
        .ok()
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend from validated configuration.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        config
            .validate()
            .map_err(StorageError::InvalidConfiguration)?;

        let region = config.region.clone();
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_error_retry + 1));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "depot-config",
            );
            builder = builder.credentials_provider(credentials);
        } else {
            builder =
                builder.credentials_provider(LazyDefaultCredentialsProvider::new(region.clone()));
        }

        let normalized_endpoint = config.endpoint.as_ref().map(|endpoint_url| {
            let lower = endpoint_url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url.clone()
            } else if config.use_http {
                format!("http://{endpoint_url}")
            } else {
                format!("https://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            builder = builder.endpoint_url(endpoint_url);

            // Plain HTTP endpoints (local MinIO) must not depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let endpoint = normalized_endpoint.unwrap_or_else(|| format!("s3.{region}.amazonaws.com"));

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            endpoint,
            region,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `bucket/key` with the key percent-encoded, as CopySource expects.
    fn copy_source(&self, key: &str) -> String {
        let encoded_key = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        format!("{}/{}", self.bucket, encoded_key)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "head", key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output
                .last_modified()
                .and_then(|dt| to_offset_datetime(key, dt)),
            content_type: output.content_type().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            metadata: output
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "get", key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend("get", key, e))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, key: &str, range: Option<ByteRange>) -> StorageResult<ByteStream> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            if range.is_empty() {
                return Ok(Box::pin(futures::stream::empty()));
            }
            request = request.range(range.to_header());
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "get", key))?;

        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end == start {
            return Ok(Bytes::new());
        }
        let range = ByteRange::new(start, end);
        if range.len() > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {} exceeds maximum {} bytes",
                range.len(),
                MAX_RANGE_SIZE
            )));
        }

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range.to_header())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "get_range", key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend("get_range", key, e))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self, data, options), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> StorageResult<()> {
        let (sse, kms_key) = sse_params(&options.server_side_encryption);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .set_content_type(options.content_type.clone())
            .set_content_disposition(options.content_disposition.clone())
            .set_content_encoding(options.content_encoding.clone())
            .set_cache_control(options.cache_control.clone())
            .set_acl(canned_acl(options.acl))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .set_metadata(user_metadata(options))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "put", key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so check first to report NotFound.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "delete", key))?;

        Ok(())
    }

    #[instrument(skip(self, options), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str, options: &PutOptions) -> StorageResult<()> {
        let (sse, kms_key) = sse_params(&options.server_side_encryption);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(self.copy_source(from))
            .set_acl(canned_acl(options.acl))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "copy", from))?;

        Ok(())
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .max_keys(page_size as i32);

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, "list", &prefix))?;

                let entries: Vec<ListEntry> = output
                    .contents()
                    .iter()
                    .filter_map(|obj| {
                        let key = obj.key()?;
                        Some(ListEntry {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            last_modified: obj
                                .last_modified()
                                .and_then(|dt| to_offset_datetime(key, dt)),
                        })
                    })
                    .collect();

                if !entries.is_empty() {
                    yield ListingPage { entries };
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(str::to_string);
                    if continuation_token.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }
        };

        Box::pin(stream)
    }

    #[instrument(skip(self, options), fields(backend = "s3"))]
    async fn create_multipart(&self, key: &str, options: &PutOptions) -> StorageResult<String> {
        let (sse, kms_key) = sse_params(&options.server_side_encryption);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(options.content_type.clone())
            .set_content_disposition(options.content_disposition.clone())
            .set_content_encoding(options.content_encoding.clone())
            .set_cache_control(options.cache_control.clone())
            .set_acl(canned_acl(options.acl))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .set_metadata(user_metadata(options))
            .send()
            .await
            .map_err(|e| StorageError::InitiationFailed {
                key: key.to_string(),
                source: Box::new(e),
            })?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::InitiationFailed {
                key: key.to_string(),
                source: "S3 did not return an upload id".into(),
            })
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_multipart_error(e, "upload_part", key, upload_id))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source: &str,
        range: ByteRange,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .copy_source(self.copy_source(source))
            .copy_source_range(range.to_header())
            .send()
            .await
            .map_err(|e| map_multipart_error(e, "upload_part_copy", key, upload_id))?;

        Ok(output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .to_string())
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        aws_sdk_s3::types::CompletedPart::builder()
                            .e_tag(&part.etag)
                            .part_number(part.part_number as i32)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_multipart_error(e, "complete_multipart", key, upload_id))?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_multipart_error(e, "abort_multipart", key, upload_id))?;

        Ok(())
    }

    #[instrument(skip(self, overrides), fields(backend = "s3"))]
    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        overrides: &ResponseOverrides,
    ) -> StorageResult<Url> {
        let response_expires = overrides
            .expires
            .as_deref()
            .map(|value| {
                DateTime::from_str(value, DateTimeFormat::HttpDate).map_err(|e| {
                    StorageError::InvalidHeaderOverride(format!("Expires: {value}: {e}"))
                })
            })
            .transpose()?;

        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::backend("presign", key, e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_response_content_disposition(overrides.content_disposition.clone())
            .set_response_cache_control(overrides.cache_control.clone())
            .set_response_content_encoding(overrides.content_encoding.clone())
            .set_response_content_language(overrides.content_language.clone())
            .set_response_content_type(overrides.content_type.clone())
            .set_response_expires(response_expires)
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error(e, "presign", key))?;

        Url::parse(presigned.uri()).map_err(|e| StorageError::backend("presign", key, e))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
        const MARKER_KEY: &str = ".depot-health-check";

        let health_check_future = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(MARKER_KEY)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "health_check", MARKER_KEY))?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(MARKER_KEY)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "health_check", MARKER_KEY))
            {
                Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            bucket: "test-bucket".to_string(),
            endpoint: Some("s3.test".to_string()),
            access_key_id: Some("access".to_string()),
            secret_access_key: Some("secret".to_string()),
            force_path_style: true,
            use_http: true,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_normalizes_endpoint() {
        let backend = S3Backend::new(&config()).await.unwrap();
        assert_eq!(backend.endpoint, "http://s3.test");
        assert_eq!(backend.region, "us-east-1");
        assert_eq!(backend.bucket(), "test-bucket");

        let backend = S3Backend::new(&StorageConfig {
            endpoint: None,
            region: "eu-west-1".to_string(),
            ..config()
        })
        .await
        .unwrap();
        assert_eq!(backend.endpoint, "s3.eu-west-1.amazonaws.com");
    }

    #[tokio::test]
    async fn test_new_requires_complete_credentials() {
        let err = S3Backend::new(&StorageConfig {
            secret_access_key: None,
            ..config()
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_copy_source_encodes_key() {
        let backend = S3Backend::new(&config()).await.unwrap();
        assert_eq!(
            backend.copy_source("5/files/a b.txt"),
            "test-bucket/5%2Ffiles%2Fa%20b%2Etxt"
        );
    }

    #[tokio::test]
    async fn test_presign_get_applies_overrides() {
        let backend = S3Backend::new(&config()).await.unwrap();
        let overrides = ResponseOverrides {
            content_type: Some("text/plain".to_string()),
            content_disposition: Some("attachment".to_string()),
            ..ResponseOverrides::default()
        };

        let url = backend
            .presign_get("5/files/a.txt", Duration::from_secs(300), &overrides)
            .await
            .unwrap();

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("response-content-type").unwrap(), "text/plain");
        assert_eq!(
            query.get("response-content-disposition").unwrap(),
            "attachment"
        );
        assert_eq!(query.get("X-Amz-Expires").unwrap(), "300");
        assert!(url.path().ends_with("/test-bucket/5/files/a.txt"));
    }

    #[tokio::test]
    async fn test_presign_rejects_malformed_expires() {
        let backend = S3Backend::new(&config()).await.unwrap();
        let overrides = ResponseOverrides {
            expires: Some("tomorrow".to_string()),
            ..ResponseOverrides::default()
        };
        let err = backend
            .presign_get("k", Duration::from_secs(60), &overrides)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidHeaderOverride(_)));
    }

    #[test]
    fn test_canned_acl_mapping() {
        assert_eq!(
            canned_acl(Some(Acl::Public)),
            Some(ObjectCannedAcl::PublicRead)
        );
        assert_eq!(canned_acl(Some(Acl::Private)), Some(ObjectCannedAcl::Private));
        assert_eq!(canned_acl(Some(Acl::Auto)), None);
    }

    #[test]
    fn test_sse_params() {
        assert_eq!(
            sse_params(&Some(ServerSideEncryption::Kms {
                key_id: "alias/k".to_string()
            })),
            (Some(SseAlgorithm::AwsKms), Some("alias/k".to_string()))
        );
        assert_eq!(sse_params(&None), (None, None));
    }
}
