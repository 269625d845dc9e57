//! CDN URL signing for depot.
//!
//! This crate provides:
//! - RSA key loading from PEM key material
//! - Canned-policy signing of CDN URLs
//! - Signature verification for issued URLs

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{CdnKeyPair, PublicKey};
pub use signer::{CannedPolicySigner, UrlSigner, canned_policy, verify_signed_url};
