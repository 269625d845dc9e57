//! Core types and shared logic for the depot storage engine.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Storage configuration and its legacy property-map form
//! - Per-domain access, expiry and quota policies
//! - Canonical backend key resolution

pub mod config;
pub mod error;
pub mod key;
pub mod policy;

pub use config::{CdnConfig, DomainConfig, EncryptionConfig, ModuleConfig, StorageConfig};
pub use error::{Error, Result};
pub use key::{KeyResolver, StorageKey};
pub use policy::{Acl, DomainPolicies, DomainPolicy};

/// Large-object threshold: 1000 MiB.
///
/// Payloads at or above this size are written through multipart sessions,
/// and server-side copies of such objects are split into copy-part ranges.
pub const DEFAULT_CHUNK_SIZE: u64 = 1000 * 1024 * 1024;

/// Smallest part the backend accepts for anything but the final part: 5 MiB.
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Domains with this suffix never count against quota and skip the recycle bin.
pub const TEMP_DOMAIN_SUFFIX: &str = "_temp";
