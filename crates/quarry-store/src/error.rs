use thiserror::Error;

/// Unified error across the artifact store.
///
/// Trust-policy violations are deliberately absent: they are values carried
/// in [`crate::trust::VerifyResult::violations`], never errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no artifact published for platform {os}/{arch}")]
    NoPlatformMatch { os: String, arch: String },

    #[error("transport error fetching {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected HTTP status {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("download exceeds the configured limit of {limit} bytes")]
    SizeExceeded { limit: u64 },

    #[error("invalid digest `{input}`: {reason}")]
    DigestSyntax { input: String, reason: String },

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("malformed public key: {0}")]
    BadKeyFormat(String),

    #[error("signature must be 64 bytes, got {0}")]
    BadSignatureLength(usize),

    #[error("archive entry `{0}` escapes the extraction root")]
    PathTraversal(String),

    #[error("extraction failed: {reason}")]
    Extract { reason: String },

    #[error("cannot detect artifact format: file is empty")]
    FormatDetect,

    #[error("invalid URL `{input}`: {reason}")]
    BadUrl { input: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid registry index: {0}")]
    Index(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
