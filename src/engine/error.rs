//! The error taxonomy of kinds (not type names) from §7.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobErrorKind {
    Permission,
    Corruption,
    Unknown,
}

impl std::fmt::Display for BlobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BlobErrorKind::Permission => "permission",
            BlobErrorKind::Corruption => "corruption",
            BlobErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database not initialized")]
    DatabaseNotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to prepare statement: {0}")]
    PrepareFailed(String),

    #[error("failed to execute statement: {0}")]
    ExecFailed(String),

    #[error("vector index facility unavailable: {0}")]
    VectorUnavailable(String),

    #[error(
        "failed to insert document {id} into collection {collection} (provided fields: {}): {reason}{}",
        provided_fields.join(", "),
        hint.as_ref().map(|h| format!(" (hint: {h})")).unwrap_or_default()
    )]
    DocumentInsertError {
        collection: String,
        id: String,
        provided_fields: Vec<String>,
        reason: String,
        hint: Option<String>,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("blob io error ({kind}): {message}")]
    BlobIoError {
        kind: BlobErrorKind,
        message: String,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The error code surfaced in the `{err: {code, message}}` envelope (§6).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DatabaseNotInitialized => "DatabaseNotInitialized",
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::PrepareFailed(_) => "PrepareFailed",
            EngineError::ExecFailed(_) => "ExecFailed",
            EngineError::VectorUnavailable(_) => "VectorUnavailable",
            EngineError::DocumentInsertError { .. } => "DocumentInsertError",
            EngineError::ValidationError(_) => "ValidationError",
            EngineError::InsufficientSpace(_) => "InsufficientSpace",
            EngineError::BlobIoError { .. } => "BlobIoError",
            EngineError::Timeout => "Timeout",
            EngineError::UnknownMethod(_) => "UnknownMethod",
            EngineError::BadRequest(_) => "BadRequest",
            EngineError::Internal(_) => "Internal",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(error: rusqlite::Error) -> Self {
        EngineError::ExecFailed(error.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::ValidationError(error.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::PermissionDenied => BlobErrorKind::Permission,
            _ => BlobErrorKind::Unknown,
        };
        EngineError::BlobIoError {
            kind,
            message: error.to_string(),
        }
    }
}
