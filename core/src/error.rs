use thiserror::Error;

/// os-explode error types
#[derive(Error, Debug)]
pub enum ExplodeError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No credential available for the API
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Watch/list privilege check failed
    #[error("Permission error: {0}")]
    PermissionError(String),

    /// Digest does not match `algorithm:hex`
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Image reference component is empty or not a single path segment
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Image metadata could not be fetched
    #[error("Metadata fetch failed: {digest} - {message}")]
    MetadataFetch { digest: String, message: String },

    /// Layer blob could not be resolved
    #[error("Blob fetch failed: {blob} - {message}")]
    BlobFetch { blob: String, message: String },

    /// Content store commit failed
    #[error("Commit failed on {branch}: {message}")]
    Commit { branch: String, message: String },

    /// Content store checkout failed
    #[error("Checkout of {commit} into {path} failed: {message}")]
    Checkout {
        commit: String,
        path: String,
        message: String,
    },

    /// Pointer file could not be written or removed
    #[error("Persistence error: {path} - {message}")]
    Persistence { path: String, message: String },

    /// API request failed
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Shutdown requested while work was pending
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ExplodeError {
    /// Short label of the pipeline stage this error belongs to, for log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            ExplodeError::ConfigError(_) => "config",
            ExplodeError::AuthError(_) => "auth",
            ExplodeError::PermissionError(_) => "permission",
            ExplodeError::InvalidDigest(_) | ExplodeError::InvalidReference(_) => "validate",
            ExplodeError::MetadataFetch { .. } => "metadata",
            ExplodeError::BlobFetch { .. } => "blob",
            ExplodeError::Commit { .. } => "commit",
            ExplodeError::Checkout { .. } => "checkout",
            ExplodeError::Persistence { .. } => "ref-update",
            ExplodeError::Api { .. } => "api",
            ExplodeError::Cancelled(_) => "cancelled",
            ExplodeError::IoError(_) => "io",
            ExplodeError::SerializationError(_) => "serialization",
            ExplodeError::Other(_) => "other",
        }
    }

    /// Whether this error must terminate the process when seen at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExplodeError::ConfigError(_)
                | ExplodeError::AuthError(_)
                | ExplodeError::PermissionError(_)
        )
    }
}

impl From<serde_json::Error> for ExplodeError {
    fn from(err: serde_json::Error) -> Self {
        ExplodeError::SerializationError(err.to_string())
    }
}

/// Result type alias for os-explode operations
pub type Result<T> = std::result::Result<T, ExplodeError>;
