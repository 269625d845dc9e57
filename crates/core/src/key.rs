//! Canonical backend keys.
//!
//! Every object lives under a key derived from `(tenant, module, domain, path)`.
//! Keys double as object identity for copy, move and recycle, so the mapping
//! must be deterministic and idempotent.

use std::fmt;

/// Logical coordinates of a stored object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub tenant: u64,
    pub module: String,
    pub domain: String,
    pub path: String,
}

impl StorageKey {
    pub fn new(
        tenant: u64,
        module: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            module: module.into(),
            domain: domain.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant, self.module, self.domain, self.path
        )
    }
}

/// Maps logical coordinates onto backend keys.
#[derive(Clone, Debug)]
pub struct KeyResolver {
    subdir: Option<String>,
    lower: bool,
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self {
            subdir: None,
            lower: true,
        }
    }
}

impl KeyResolver {
    /// Create a resolver.
    ///
    /// A `subdir` of `"/"` (or `"\"`) disables tenant/module/domain prefixing
    /// entirely; any other non-empty value replaces that prefix.
    pub fn new(subdir: Option<String>, lower: bool) -> Self {
        let subdir = subdir.filter(|s| !s.is_empty());
        Self { subdir, lower }
    }

    pub fn is_case_folding(&self) -> bool {
        self.lower
    }

    /// Resolve a key. Pure and total.
    pub fn resolve(&self, tenant: u64, module: &str, domain: &str, path: &str) -> String {
        let path = normalize_path(path);

        let joined = match self.subdir.as_deref() {
            Some("/") | Some("\\") => path,
            Some(subdir) => format!("{subdir}/{path}"),
            None => format!("{tenant}/{module}/{domain}/{path}"),
        };

        let key = collapse_separators(&joined.replace('\\', "/"));
        if self.lower { key.to_lowercase() } else { key }
    }

    /// Resolve a [`StorageKey`].
    pub fn resolve_key(&self, key: &StorageKey) -> String {
        self.resolve(key.tenant, &key.module, &key.domain, &key.path)
    }

    /// Invert [`resolve`](Self::resolve) for keys this resolver produced.
    ///
    /// With a sub-directory override the tenant, module and domain are not
    /// recoverable, so they come back as `0` and empty strings.
    pub fn parse(&self, key: &str) -> Option<StorageKey> {
        match self.subdir.as_deref() {
            Some("/") | Some("\\") => Some(StorageKey::new(0, "", "", key)),
            Some(subdir) => {
                let mut prefix = collapse_separators(&subdir.replace('\\', "/"));
                if self.lower {
                    prefix = prefix.to_lowercase();
                }
                let rest = if prefix.is_empty() {
                    key
                } else if key == prefix {
                    ""
                } else {
                    key.strip_prefix(prefix.as_str())?.strip_prefix('/')?
                };
                Some(StorageKey::new(0, "", "", rest))
            }
            None => {
                let mut parts = key.splitn(4, '/');
                let tenant = parts.next()?.parse().ok()?;
                let module = parts.next()?;
                let domain = parts.next().unwrap_or_default();
                let path = parts.next().unwrap_or_default();
                Some(StorageKey::new(tenant, module, domain, path))
            }
        }
    }

    /// Resolve the directory prefix for `path` within a domain, with a trailing slash.
    pub fn resolve_dir(&self, tenant: u64, module: &str, domain: &str, path: &str) -> String {
        let mut dir = self.resolve(tenant, module, domain, path);
        if !dir.is_empty() {
            dir.push('/');
        }
        dir
    }

    /// Strip a resolved directory `prefix` from `key`.
    ///
    /// Returns `None` when `key` does not live under `prefix`.
    pub fn relative_to<'k>(&self, prefix: &str, key: &'k str) -> Option<&'k str> {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Some(key.trim_start_matches('/'));
        }
        let rest = key.strip_prefix(prefix)?;
        if rest.is_empty() {
            return Some(rest);
        }
        rest.strip_prefix('/')
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches(['\\', '/'])
        .trim_end_matches('/')
        .replace('\\', "/")
}

/// Collapse runs of `/` and trim separators at both ends.
fn collapse_separators(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
