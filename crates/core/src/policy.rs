//! Per-domain access policies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Canned access control applied to written objects.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Acl {
    /// Anyone may read the object through its shared URL.
    Public,
    /// Only signed requests may read the object.
    Private,
    /// Defer to the domain policy.
    #[default]
    Auto,
}

/// Policy for one domain of a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainPolicy {
    pub acl: Acl,
    /// Default lifetime of issued URLs. Zero means "shared, unsigned".
    pub expiry: Duration,
    pub content_as_attachment: bool,
    pub quota_exempt: bool,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self {
            acl: Acl::Auto,
            expiry: Duration::ZERO,
            content_as_attachment: false,
            quota_exempt: false,
        }
    }
}

/// Immutable policy table for a configured module.
///
/// Lookups fall back to the module-wide default when a domain has no entry.
#[derive(Clone, Debug, Default)]
pub struct DomainPolicies {
    default: DomainPolicy,
    domains: HashMap<String, DomainPolicy>,
}

impl DomainPolicies {
    pub fn new(default: DomainPolicy, domains: HashMap<String, DomainPolicy>) -> Self {
        Self { default, domains }
    }

    pub fn policy(&self, domain: &str) -> &DomainPolicy {
        self.domains.get(domain).unwrap_or(&self.default)
    }

    pub fn expiry(&self, domain: &str) -> Duration {
        self.policy(domain).expiry
    }

    pub fn is_quota_exempt(&self, domain: &str) -> bool {
        is_temp_domain(domain) || self.policy(domain).quota_exempt
    }

    /// Resolve the concrete ACL for a write.
    ///
    /// Explicit requests win. For [`Acl::Auto`], a domain with a non-zero
    /// expiry is private; otherwise the domain ACL applies, then the module
    /// default, and public when nothing is configured.
    pub fn resolve_acl(&self, domain: &str, requested: Acl) -> Acl {
        if requested != Acl::Auto {
            return requested;
        }

        let policy = self.policy(domain);
        if !policy.expiry.is_zero() {
            return Acl::Private;
        }

        match (policy.acl, self.default.acl) {
            (Acl::Auto, Acl::Auto) => Acl::Public,
            (Acl::Auto, module) => module,
            (domain_acl, _) => domain_acl,
        }
    }
}

pub fn is_temp_domain(domain: &str) -> bool {
    domain.ends_with(crate::TEMP_DOMAIN_SUFFIX)
}
