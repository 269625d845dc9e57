//! Errors raised while loading CDN keys and signing or checking URLs.

use std::path::PathBuf;
use thiserror::Error;

/// Failures of canned-policy URL signing.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The PEM text is not an RSA private key in PKCS#1 or PKCS#8 form.
    #[error("invalid CDN private key: {0}")]
    InvalidPrivateKey(String),

    #[error("cannot read CDN key file {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// RSA-SHA1 signing of the policy document failed.
    #[error("failed to sign canned policy: {0}")]
    PolicySigning(String),

    /// A signed URL lacks `Expires` or `Signature`, or one of them does not decode.
    #[error("malformed signed URL: {0}")]
    MalformedSignedUrl(String),

    #[error("signature does not match the canned policy")]
    SignatureMismatch,
}

pub type SignerResult<T> = std::result::Result<T, SignerError>;
