use async_trait::async_trait;
use dashmap::DashMap;
use depot_storage::{QuotaController, QuotaError};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Quota ledger kept in memory, keyed by `(domain, owner)`.
///
/// Increments and decrements go through the map's per-entry locks, so
/// concurrent writers never lose an update.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MemoryQuotaController {
    used: DashMap<(String, Uuid), i64>,
    limit: Option<u64>,
    exclude: Option<String>,
    unavailable: AtomicBool,
}

#[allow(dead_code)]
impl MemoryQuotaController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would take an owner past `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    /// Make every ledger update fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_used(&self, domain: &str, owner: Uuid, bytes: i64) {
        self.used.insert((domain.to_string(), owner), bytes);
    }

    pub fn used(&self, domain: &str, owner: Uuid) -> i64 {
        self.used
            .get(&(domain.to_string(), owner))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn owner_total(&self, owner: Uuid) -> i64 {
        self.used
            .iter()
            .filter(|entry| entry.key().1 == owner)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn total(&self) -> i64 {
        self.used.iter().map(|entry| *entry.value()).sum()
    }

    fn check_available(&self) -> Result<(), QuotaError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QuotaError::Ledger("ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaController for MemoryQuotaController {
    async fn quota_used_check(&self, bytes: u64, owner: Uuid) -> Result<(), QuotaError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        if self.owner_total(owner).max(0) as u64 + bytes > limit {
            return Err(QuotaError::Exceeded);
        }
        Ok(())
    }

    async fn quota_used_add(
        &self,
        _module: &str,
        domain: &str,
        bytes: u64,
        owner: Uuid,
    ) -> Result<(), QuotaError> {
        self.check_available()?;
        *self.used.entry((domain.to_string(), owner)).or_default() += bytes as i64;
        Ok(())
    }

    async fn quota_used_delete(
        &self,
        _module: &str,
        domain: &str,
        bytes: u64,
        owner: Uuid,
    ) -> Result<(), QuotaError> {
        self.check_available()?;
        *self.used.entry((domain.to_string(), owner)).or_default() -= bytes as i64;
        Ok(())
    }

    async fn quota_used_set(
        &self,
        _module: &str,
        domain: &str,
        bytes: u64,
    ) -> Result<(), QuotaError> {
        self.check_available()?;
        self.used.retain(|(d, _), _| d != domain);
        self.used.insert((domain.to_string(), Uuid::nil()), bytes as i64);
        Ok(())
    }

    fn exclude_pattern(&self) -> Option<&str> {
        self.exclude.as_deref()
    }
}
