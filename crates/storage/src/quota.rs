//! Quota accounting around writes and deletes.
//!
//! The ledger lives in an external [`QuotaController`]. The gate pre-checks
//! space before any backend I/O, and applies a delta only after the backend
//! has confirmed the write or delete, so the ledger can lag behind stored
//! bytes but never run ahead of them.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use depot_core::DomainPolicies;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a quota controller.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota exceeded")]
    Exceeded,

    #[error("quota ledger unavailable: {0}")]
    Ledger(String),
}

/// External quota authority.
///
/// Increments and decrements must be atomic on the controller side; the gate
/// never reads, modifies and writes the ledger itself.
#[async_trait]
pub trait QuotaController: Send + Sync {
    /// Fail with [`QuotaError::Exceeded`] if `bytes` more would not fit.
    async fn quota_used_check(&self, bytes: u64, owner: Uuid) -> Result<(), QuotaError>;

    async fn quota_used_add(
        &self,
        module: &str,
        domain: &str,
        bytes: u64,
        owner: Uuid,
    ) -> Result<(), QuotaError>;

    async fn quota_used_delete(
        &self,
        module: &str,
        domain: &str,
        bytes: u64,
        owner: Uuid,
    ) -> Result<(), QuotaError>;

    /// Overwrite the ledger for a domain.
    async fn quota_used_set(&self, module: &str, domain: &str, bytes: u64)
    -> Result<(), QuotaError>;

    /// Files whose name starts with this pattern are not charged when deleted in bulk.
    fn exclude_pattern(&self) -> Option<&str> {
        None
    }
}

/// A ledger adjustment for one domain and owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaDelta {
    pub domain: String,
    pub owner_id: Uuid,
    pub bytes: i64,
}

/// Wraps writes and deletes with quota pre-checks and post-commit deltas.
#[derive(Clone)]
pub struct QuotaGate {
    controller: Option<Arc<dyn QuotaController>>,
    module: String,
    policies: Arc<DomainPolicies>,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate")
            .field("module", &self.module)
            .field("enabled", &self.controller.is_some())
            .finish()
    }
}

impl QuotaGate {
    pub fn new(
        controller: Option<Arc<dyn QuotaController>>,
        module: impl Into<String>,
        policies: Arc<DomainPolicies>,
    ) -> Self {
        Self {
            controller,
            module: module.into(),
            policies,
        }
    }

    /// Controller to charge for `domain`, if quota applies to it at all.
    fn enforced(&self, domain: &str) -> Option<&Arc<dyn QuotaController>> {
        self.controller
            .as_ref()
            .filter(|_| !self.policies.is_quota_exempt(domain))
    }

    pub fn is_enforced(&self, domain: &str) -> bool {
        self.enforced(domain).is_some()
    }

    pub fn controller(&self) -> Option<&Arc<dyn QuotaController>> {
        self.controller.as_ref()
    }

    /// Run a write under quota control. `proceed` returns the bytes actually written.
    pub async fn write<F, Fut>(
        &self,
        domain: &str,
        owner: Uuid,
        size_hint: u64,
        proceed: F,
    ) -> StorageResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<u64>>,
    {
        self.write_replacing(domain, owner, size_hint, 0, proceed)
            .await
    }

    /// Like [`write`](Self::write), for a write that replaces `replaced` existing bytes.
    pub async fn write_replacing<F, Fut>(
        &self,
        domain: &str,
        owner: Uuid,
        size_hint: u64,
        replaced: u64,
        proceed: F,
    ) -> StorageResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<u64>>,
    {
        if let Some(controller) = self.enforced(domain) {
            controller
                .quota_used_check(size_hint, owner)
                .await
                .map_err(|e| match e {
                    QuotaError::Exceeded => StorageError::QuotaExceeded {
                        requested: size_hint,
                    },
                    QuotaError::Ledger(msg) => {
                        StorageError::backend("quota_check", domain, msg)
                    }
                })?;
        }

        let written = proceed().await?;

        self.apply(QuotaDelta {
            domain: domain.to_string(),
            owner_id: owner,
            bytes: written as i64 - replaced as i64,
        })
        .await;

        Ok(written)
    }

    /// Run a delete under quota control. `proceed` returns the bytes removed.
    pub async fn delete<F, Fut>(&self, domain: &str, owner: Uuid, proceed: F) -> StorageResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<u64>>,
    {
        let removed = proceed().await?;

        self.apply(QuotaDelta {
            domain: domain.to_string(),
            owner_id: owner,
            bytes: -(removed as i64),
        })
        .await;

        Ok(removed)
    }

    /// Apply a committed delta. Ledger failures are logged, never propagated.
    pub async fn apply(&self, delta: QuotaDelta) {
        let Some(controller) = self.enforced(&delta.domain) else {
            return;
        };

        let result = match delta.bytes {
            0 => return,
            bytes if bytes > 0 => {
                controller
                    .quota_used_add(&self.module, &delta.domain, bytes as u64, delta.owner_id)
                    .await
            }
            bytes => {
                controller
                    .quota_used_delete(
                        &self.module,
                        &delta.domain,
                        bytes.unsigned_abs(),
                        delta.owner_id,
                    )
                    .await
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                module = %self.module,
                domain = %delta.domain,
                owner = %delta.owner_id,
                bytes = delta.bytes,
                error = %e,
                "Quota ledger update failed, stored bytes and ledger may diverge"
            );
        }
    }

    /// Overwrite the ledger for `domain` with a measured size.
    pub async fn reset(&self, domain: &str, bytes: u64) -> StorageResult<()> {
        let Some(controller) = self.enforced(domain) else {
            return Ok(());
        };
        controller
            .quota_used_set(&self.module, domain, bytes)
            .await
            .map_err(|e| StorageError::backend("quota_reset", domain, e))
    }
}
