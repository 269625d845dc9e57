//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {requested} bytes requested")]
    QuotaExceeded { requested: u64 },

    #[error("invalid header override: {0}")]
    InvalidHeaderOverride(String),

    #[error("multipart session {upload_id} for {key} no longer exists")]
    SessionExpired { key: String, upload_id: String },

    #[error("multipart session for {0} has no parts")]
    IncompleteUpload(String),

    #[error("failed to initiate multipart upload for {key}: {source}")]
    InitiationFailed {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("multipart session {upload_id} is {state}, cannot {operation}")]
    InvalidSessionState {
        upload_id: String,
        state: &'static str,
        operation: &'static str,
    },

    #[error("invalid part number {part_number} (next expected at least {expected})")]
    InvalidPartNumber { part_number: u32, expected: u32 },

    #[error("part too small for {0}")]
    EntityTooSmall(String),

    #[error("backend error during {operation} on {key}: {source}")]
    BackendUnavailable {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no extension slot available")]
    SlotsExhausted,

    #[error("operation cancelled")]
    Cancelled,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("signing error: {0}")]
    Signing(#[from] depot_signer::SignerError),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn backend(
        operation: &'static str,
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::BackendUnavailable {
            operation,
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<depot_core::Error> for StorageError {
    fn from(err: depot_core::Error) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
