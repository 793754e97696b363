use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these —
// never on the human-readable message string.

/// Stable error code constants.
///
/// Codes never change; messages may be reworded.
pub mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── ServiceError ────────────────────────────────────────────────────

/// Unified service error type used across all modules.
///
/// Each variant maps to a stable error code (see [`error_code`]). The
/// API layer embedding this core decides how codes map to its own
/// transport (HTTP status, RPC code, close frame).
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Input data is invalid.
    #[error("{0}")]
    Validation(String),

    /// Storage backend failure.
    #[error("{0}")]
    Storage(String),

    /// The backing store could not be reached. The entity's state is
    /// unknown — callers must retry, never treat this as "absent".
    #[error("{0}")]
    Unavailable(String),

    /// Unexpected internal error.
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_code::NOT_FOUND,
            ServiceError::Validation(_) => error_code::VALIDATION_FAILED,
            ServiceError::Storage(_) => error_code::STORAGE_ERROR,
            ServiceError::Unavailable(_) => error_code::UNAVAILABLE,
            ServiceError::Internal(_) => error_code::INTERNAL,
        }
    }
}
