//! Configuration types shared across crates.

use crate::error::{Error, Result};
use crate::key::KeyResolver;
use crate::policy::{Acl, DomainPolicies, DomainPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket name.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Optional endpoint URL (for MinIO, etc.).
    pub endpoint: Option<String>,
    /// AWS access key ID. Falls back to the ambient credential chain if not set.
    pub access_key_id: Option<String>,
    /// AWS secret access key. Falls back to the ambient credential chain if not set.
    pub secret_access_key: Option<String>,
    /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
    #[serde(default)]
    pub force_path_style: bool,
    /// Talk to the endpoint over plain HTTP.
    #[serde(default)]
    pub use_http: bool,
    /// Retry budget handed to the SDK; the engine itself never retries.
    #[serde(default = "default_max_error_retry")]
    pub max_error_retry: u32,
    /// Key prefix replacing `{tenant}/{module}/{domain}`. `"/"` disables prefixing.
    pub subdir: Option<String>,
    /// Lower-case every resolved key.
    #[serde(default = "default_lower")]
    pub lower: bool,
    /// Root for shared URLs over HTTP.
    pub cname: Option<String>,
    /// Root for shared URLs over HTTPS.
    pub cname_ssl: Option<String>,
    /// Key prefix receiving copies of deleted objects.
    pub recycle_dir: Option<String>,
    #[serde(default)]
    pub recycle_use: bool,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub cdn: CdnConfig,
    /// Large-object threshold in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Minimum size of any multipart part but the last.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
}

/// Encryption applied to written objects.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EncryptionConfig {
    #[default]
    None,
    /// Backend-managed AES-256.
    ServerManaged,
    /// Backend-side encryption under a KMS key.
    ServerKms { key_id: Option<String> },
    /// Envelope encryption performed before upload with KMS data keys.
    ClientKms { key_id: Option<String> },
}

/// CDN signed-URL configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CdnConfig {
    #[serde(default)]
    pub enabled: bool,
    pub key_pair_id: Option<String>,
    /// PEM-encoded RSA private key.
    pub private_key_path: Option<PathBuf>,
    /// Distribution host, e.g. `d111111abcdef8.cloudfront.net`.
    pub distribution_domain: Option<String>,
}

/// Module configuration: the default policy plus per-domain overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    #[serde(default)]
    pub acl: Acl,
    /// Default URL lifetime in seconds; zero issues shared URLs.
    #[serde(default)]
    pub expires_secs: u64,
    #[serde(default)]
    pub content_as_attachment: bool,
    #[serde(default)]
    pub quota_exempt: bool,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// Per-domain overrides. Unset fields inherit from the module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub acl: Option<Acl>,
    pub expires_secs: Option<u64>,
    pub content_as_attachment: Option<bool>,
    #[serde(default)]
    pub quota_exempt: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_error_retry() -> u32 {
    3
}

fn default_lower() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_min_part_size() -> u64 {
    crate::DEFAULT_MIN_PART_SIZE
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            use_http: false,
            max_error_retry: default_max_error_retry(),
            subdir: None,
            lower: default_lower(),
            cname: None,
            cname_ssl: None,
            recycle_dir: None,
            recycle_use: false,
            encryption: EncryptionConfig::default(),
            cdn: CdnConfig::default(),
            chunk_size: default_chunk_size(),
            min_part_size: default_min_part_size(),
        }
    }
}

impl StorageConfig {
    /// Build a configuration from the legacy string property map.
    ///
    /// Unknown keys are ignored. The result is validated before it is returned.
    pub fn from_props(props: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            props
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mut config = StorageConfig {
            bucket: get("bucket").unwrap_or_default(),
            access_key_id: get("acesskey"),
            secret_access_key: get("secretaccesskey"),
            endpoint: get("serviceurl"),
            subdir: get("subdir"),
            cname: get("cname"),
            cname_ssl: get("cnamessl"),
            recycle_dir: get("recycleDir"),
            ..StorageConfig::default()
        };

        if let Some(region) = get("region") {
            config.region = region;
        }
        if let Some(value) = get("forcepathstyle") {
            config.force_path_style = parse_bool("forcepathstyle", &value)?;
        }
        if let Some(value) = get("usehttp") {
            config.use_http = parse_bool("usehttp", &value)?;
        }
        if let Some(value) = get("lower") {
            config.lower = parse_bool("lower", &value)?;
        }
        if let Some(value) = get("recycleUse") {
            config.recycle_use = parse_bool("recycleUse", &value)?;
        }
        if let Some(value) = get("chunksize") {
            config.chunk_size = parse_u64("chunksize", &value)?;
        }
        if let Some(value) = get("minpartsize") {
            config.min_part_size = parse_u64("minpartsize", &value)?;
        }

        let sse_key = get("ssekey");
        config.encryption = match get("sse").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("none") => EncryptionConfig::None,
            Some("aes256") => EncryptionConfig::ServerManaged,
            Some("awskms") => EncryptionConfig::ServerKms { key_id: sse_key },
            Some("clientawskms") => EncryptionConfig::ClientKms { key_id: sse_key },
            Some(other) => {
                return Err(Error::InvalidProperty {
                    key: "sse".to_string(),
                    value: other.to_string(),
                });
            }
        };

        if let Some(value) = get("cdn_enabled") {
            config.cdn.enabled = parse_bool("cdn_enabled", &value)?;
        }
        config.cdn.key_pair_id = get("cdn_keyPairId");
        config.cdn.private_key_path = get("cdn_privateKeyPath").map(PathBuf::from);
        config.cdn.distribution_domain = get("cdn_distributionDomain");

        config.validate().map_err(Error::InvalidConfiguration)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.bucket.trim().is_empty() {
            return Err("bucket is required".to_string());
        }

        if self.access_key_id.is_some() ^ self.secret_access_key.is_some() {
            return Err(
                "access_key_id and secret_access_key must be set together".to_string(),
            );
        }

        match &self.encryption {
            EncryptionConfig::ServerKms { key_id } | EncryptionConfig::ClientKms { key_id }
                if key_id.as_deref().is_none_or(|k| k.trim().is_empty()) =>
            {
                return Err("KMS encryption requires a key id".to_string());
            }
            _ => {}
        }

        if self.cdn.enabled {
            if self.cdn.key_pair_id.is_none() {
                return Err("cdn.key_pair_id is required when the CDN is enabled".to_string());
            }
            if self.cdn.private_key_path.is_none() {
                return Err(
                    "cdn.private_key_path is required when the CDN is enabled".to_string(),
                );
            }
            if self.cdn.distribution_domain.is_none() {
                return Err(
                    "cdn.distribution_domain is required when the CDN is enabled".to_string(),
                );
            }
        }

        if self.min_part_size == 0 {
            return Err("min_part_size must be greater than zero".to_string());
        }
        if self.chunk_size < self.min_part_size.saturating_mul(2) {
            return Err(format!(
                "chunk_size ({}) must be at least twice min_part_size ({})",
                self.chunk_size, self.min_part_size
            ));
        }

        for (name, root) in [("cname", &self.cname), ("cname_ssl", &self.cname_ssl)] {
            if let Some(root) = root {
                Url::parse(root).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
            }
        }

        if self.recycle_use && self.recycle_dir.as_deref().is_none_or(str::is_empty) {
            return Err("recycle_dir is required when recycle_use is set".to_string());
        }

        Ok(())
    }

    /// Key resolver for this configuration.
    pub fn key_resolver(&self) -> KeyResolver {
        KeyResolver::new(self.subdir.clone(), self.lower)
    }

    /// Root under which shared (unsigned) URLs are built, with a trailing slash.
    pub fn bucket_root(&self, secure: bool) -> std::result::Result<Url, url::ParseError> {
        let cname = if secure { &self.cname_ssl } else { &self.cname };
        let root = match (cname, &self.endpoint) {
            (Some(cname), _) => cname.clone(),
            (None, Some(endpoint)) => {
                format!("{}/{}/", endpoint.trim_end_matches('/'), self.bucket)
            }
            (None, None) => {
                let scheme = if secure { "https" } else { "http" };
                format!(
                    "{scheme}://s3.{}.amazonaws.com/{}/",
                    self.region, self.bucket
                )
            }
        };

        if root.ends_with('/') {
            Url::parse(&root)
        } else {
            Url::parse(&format!("{root}/"))
        }
    }
}

impl ModuleConfig {
    /// Build the immutable policy table for this module.
    pub fn policies(&self) -> DomainPolicies {
        let default = DomainPolicy {
            acl: self.acl,
            expiry: Duration::from_secs(self.expires_secs),
            content_as_attachment: self.content_as_attachment,
            quota_exempt: self.quota_exempt,
        };

        let domains: HashMap<String, DomainPolicy> = self
            .domains
            .iter()
            .map(|domain| {
                let policy = DomainPolicy {
                    acl: domain.acl.unwrap_or(Acl::Auto),
                    expiry: domain
                        .expires_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default.expiry),
                    content_as_attachment: domain
                        .content_as_attachment
                        .unwrap_or(default.content_as_attachment),
                    quota_exempt: domain.quota_exempt || default.quota_exempt,
                };
                (domain.name.clone(), policy)
            })
            .collect();

        DomainPolicies::new(default, domains)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::InvalidProperty {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::InvalidProperty {
        key: key.to_string(),
        value: value.to_string(),
    })
}
