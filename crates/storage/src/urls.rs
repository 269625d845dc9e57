//! Time-limited access URLs.
//!
//! Direct URLs are presigned by the backend. CDN URLs point at the
//! distribution and carry a canned-policy signature. Header overrides come
//! in as `"Name: value"` strings and are checked against a closed list.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectStore, ResponseOverrides};
use depot_core::{DomainPolicies, KeyResolver, StorageConfig};
use depot_signer::{CannedPolicySigner, CdnKeyPair, UrlSigner};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;
use url::Url;

/// Facts about the inbound request an URL is issued for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub secure: bool,
}

impl RequestContext {
    pub fn secure() -> Self {
        Self { secure: true }
    }

    pub fn insecure() -> Self {
        Self { secure: false }
    }
}

/// HTTPS unless the caller is an explicitly insecure request.
fn is_secure(request: Option<&RequestContext>) -> bool {
    request.is_none_or(|r| r.secure)
}

/// A response header override accepted by the issuer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseHeader {
    ContentDisposition(String),
    CacheControl(String),
    ContentEncoding(String),
    ContentLanguage(String),
    ContentType(String),
    Expires(String),
    /// CDN cache partitioning; not valid for direct URLs.
    CustomCacheKey(String),
}

impl ResponseHeader {
    /// Parse `"Name: value"`. Names are matched case-insensitively.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidHeaderOverride(raw.to_string());
        let (name, value) = raw.split_once(':').ok_or_else(invalid)?;
        let value = value.trim().to_string();

        let header = match name.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => Self::ContentDisposition(value),
            "cache-control" => Self::CacheControl(value),
            "content-encoding" => Self::ContentEncoding(value),
            "content-language" => Self::ContentLanguage(value),
            "content-type" => Self::ContentType(value),
            "expires" => Self::Expires(value),
            "custom-cache-key" => Self::CustomCacheKey(value),
            _ => return Err(invalid()),
        };
        Ok(header)
    }

    /// Query parameter carrying this override on a CDN URL.
    pub fn query_name(&self) -> &'static str {
        match self {
            Self::ContentDisposition(_) => "response-content-disposition",
            Self::CacheControl(_) => "response-cache-control",
            Self::ContentEncoding(_) => "response-content-encoding",
            Self::ContentLanguage(_) => "response-content-language",
            Self::ContentType(_) => "response-content-type",
            Self::Expires(_) => "response-expires",
            Self::CustomCacheKey(_) => "custom-cache-key",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::ContentDisposition(v)
            | Self::CacheControl(v)
            | Self::ContentEncoding(v)
            | Self::ContentLanguage(v)
            | Self::ContentType(v)
            | Self::Expires(v)
            | Self::CustomCacheKey(v) => v,
        }
    }
}

/// Translate raw headers into backend response overrides.
pub fn response_overrides(headers: &[String]) -> StorageResult<ResponseOverrides> {
    let mut overrides = ResponseOverrides::default();
    for raw in headers {
        match ResponseHeader::parse(raw)? {
            ResponseHeader::ContentDisposition(v) => overrides.content_disposition = Some(v),
            ResponseHeader::CacheControl(v) => overrides.cache_control = Some(v),
            ResponseHeader::ContentEncoding(v) => overrides.content_encoding = Some(v),
            ResponseHeader::ContentLanguage(v) => overrides.content_language = Some(v),
            ResponseHeader::ContentType(v) => overrides.content_type = Some(v),
            ResponseHeader::Expires(v) => overrides.expires = Some(v),
            ResponseHeader::CustomCacheKey(_) => {
                return Err(StorageError::InvalidHeaderOverride(raw.clone()));
            }
        }
    }
    Ok(overrides)
}

/// Append `key` to `root` one segment at a time so separators survive and
/// everything else is percent-encoded.
fn join_key(root: &Url, key: &str) -> StorageResult<Url> {
    let mut url = root.clone();
    url.path_segments_mut()
        .map_err(|_| StorageError::InvalidConfiguration(format!("{root} cannot be a base URL")))?
        .pop_if_empty()
        .extend(key.split('/'));
    Ok(url)
}

fn parse_root(raw: &str) -> StorageResult<Url> {
    let raw = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&raw)
        .map_err(|e| StorageError::InvalidConfiguration(format!("invalid URL root {raw}: {e}")))
}

struct CdnTarget {
    distribution: String,
    signer: Arc<dyn UrlSigner>,
}

/// Issues direct and CDN URLs for one tenant module.
pub struct AccessUrlIssuer {
    store: Arc<dyn ObjectStore>,
    resolver: KeyResolver,
    policies: Arc<DomainPolicies>,
    tenant: u64,
    module: String,
    shared_root: Url,
    shared_root_ssl: Url,
    cname: Option<Url>,
    cname_ssl: Option<Url>,
    cdn: Option<CdnTarget>,
}

impl std::fmt::Debug for AccessUrlIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUrlIssuer")
            .field("tenant", &self.tenant)
            .field("module", &self.module)
            .field("shared_root_ssl", &self.shared_root_ssl.as_str())
            .field(
                "cdn",
                &self.cdn.as_ref().map(|cdn| cdn.distribution.as_str()),
            )
            .finish_non_exhaustive()
    }
}

impl AccessUrlIssuer {
    /// Build from configuration. Loads the CDN key when the CDN is enabled.
    pub fn from_config(
        config: &StorageConfig,
        store: Arc<dyn ObjectStore>,
        tenant: u64,
        module: impl Into<String>,
        policies: Arc<DomainPolicies>,
    ) -> StorageResult<Self> {
        let root = |secure| {
            config.bucket_root(secure).map_err(|e| {
                StorageError::InvalidConfiguration(format!("invalid bucket root: {e}"))
            })
        };

        let mut issuer = Self {
            store,
            resolver: config.key_resolver(),
            policies,
            tenant,
            module: module.into(),
            shared_root: root(false)?,
            shared_root_ssl: root(true)?,
            cname: config.cname.as_deref().map(parse_root).transpose()?,
            cname_ssl: config.cname_ssl.as_deref().map(parse_root).transpose()?,
            cdn: None,
        };

        if config.cdn.enabled {
            let (Some(key_pair_id), Some(key_path), Some(distribution)) = (
                &config.cdn.key_pair_id,
                &config.cdn.private_key_path,
                &config.cdn.distribution_domain,
            ) else {
                return Err(StorageError::InvalidConfiguration(
                    "CDN is enabled but not fully configured".to_string(),
                ));
            };
            let keypair = CdnKeyPair::from_pem_file(key_pair_id.clone(), key_path)?;
            issuer = issuer.with_cdn(distribution.clone(), Arc::new(CannedPolicySigner::new(keypair)));
        }

        Ok(issuer)
    }

    /// Route CDN URLs through `distribution`, signed by `signer`.
    pub fn with_cdn(mut self, distribution: impl Into<String>, signer: Arc<dyn UrlSigner>) -> Self {
        self.cdn = Some(CdnTarget {
            distribution: distribution.into(),
            signer,
        });
        self
    }

    pub fn cdn_enabled(&self) -> bool {
        self.cdn.is_some()
    }

    fn key(&self, domain: &str, path: &str) -> String {
        self.resolver.resolve(self.tenant, &self.module, domain, path)
    }

    /// Expiry to sign with, or `None` for an unsigned URL.
    fn effective_expiry(&self, domain: &str, expiry: Duration) -> Option<Duration> {
        let unset = |d: Duration| d.is_zero() || d == Duration::MAX;
        let expiry = if unset(expiry) {
            self.policies.expiry(domain)
        } else {
            expiry
        };
        (!unset(expiry)).then_some(expiry)
    }

    /// Unsigned URL under the bucket root, or the cname root when configured.
    pub fn shared_url(&self, domain: &str, path: &str, request: Option<&RequestContext>) -> StorageResult<Url> {
        let root = if is_secure(request) {
            &self.shared_root_ssl
        } else {
            &self.shared_root
        };
        join_key(root, &self.key(domain, path))
    }

    /// Issue a direct URL.
    ///
    /// A zero or `Duration::MAX` expiry falls back to the domain default; when
    /// that is zero as well the shared URL is returned.
    #[instrument(skip(self, headers, request), fields(tenant = self.tenant, module = %self.module))]
    pub async fn issue(
        &self,
        domain: &str,
        path: &str,
        expiry: Duration,
        headers: &[String],
        request: Option<&RequestContext>,
    ) -> StorageResult<Url> {
        let Some(expiry) = self.effective_expiry(domain, expiry) else {
            return self.shared_url(domain, path, request);
        };

        let overrides = response_overrides(headers)?;
        let key = self.key(domain, path);
        let presigned = self.store.presign_get(&key, expiry, &overrides).await?;
        self.rebase(presigned, is_secure(request))
    }

    /// Apply the request scheme and move the URL under the cname root if one is set.
    fn rebase(&self, mut url: Url, secure: bool) -> StorageResult<Url> {
        let scheme = if secure { "https" } else { "http" };
        if let Err(()) = url.set_scheme(scheme) {
            return Err(StorageError::backend(
                "presign",
                url.path(),
                format!("cannot serve {} URL over {scheme}", url.scheme()),
            ));
        }

        let cname = if secure { &self.cname_ssl } else { &self.cname };
        let Some(root) = cname else {
            return Ok(url);
        };
        if url.as_str().starts_with(root.as_str()) {
            return Ok(url);
        }

        let mut rebased = root
            .join(url.path().trim_start_matches('/'))
            .map_err(|e| StorageError::backend("presign", url.path(), e))?;
        rebased.set_query(url.query());
        Ok(rebased)
    }

    /// Issue a CDN URL, or a direct one when no CDN is configured.
    #[instrument(skip(self, headers, request), fields(tenant = self.tenant, module = %self.module))]
    pub async fn cdn_issue(
        &self,
        domain: &str,
        path: &str,
        expiry: Duration,
        headers: &[String],
        request: Option<&RequestContext>,
    ) -> StorageResult<Url> {
        let Some(cdn) = &self.cdn else {
            return self.issue(domain, path, expiry, headers, request).await;
        };

        let scheme = if is_secure(request) { "https" } else { "http" };
        let root = parse_root(&format!("{scheme}://{}", cdn.distribution))?;
        let mut url = join_key(&root, &self.key(domain, path))?;

        let parsed = headers
            .iter()
            .map(|raw| ResponseHeader::parse(raw))
            .collect::<StorageResult<Vec<_>>>()?;
        if !parsed.is_empty() {
            let mut query = url.query_pairs_mut();
            for header in &parsed {
                query.append_pair(header.query_name(), header.value());
            }
        }

        let Some(expiry) = self.effective_expiry(domain, expiry) else {
            return Ok(url);
        };
        let expires = time::Duration::try_from(expiry)
            .ok()
            .and_then(|d| OffsetDateTime::now_utc().checked_add(d))
            .ok_or_else(|| {
                StorageError::InvalidConfiguration(format!("expiry {expiry:?} is out of range"))
            })?;

        Ok(cdn.signer.sign_url(&url, expires)?)
    }
}
