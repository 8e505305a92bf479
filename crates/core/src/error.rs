//! Error taxonomy with stable wire codes.
//!
//! Validation errors are local and never propagate past the operation that
//! raised them. Disk and store failures surface as `Internal` (`UNKNOWN` on
//! the wire) unless they map to a more specific variant.

use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid kind {0:?} (expected ^[a-z][a-z0-9_-]*$)")]
    InvalidKind(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("kind {0:?} is an entity kind and requires identity_key")]
    MissingIdentityKey(String),

    /// Also returned for ids owned by another tenant — existence never leaks.
    #[error("not found")]
    NotFound,

    #[error("vault root not found: {0}")]
    VaultNotFound(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("ingest failed: {0}")]
    IngestFailed(String),

    #[error("path escapes vault root: {0}")]
    PathTraversal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Stable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidInput(_) => "INVALID_INPUT",
            VaultError::InvalidKind(_) => "INVALID_KIND",
            VaultError::InvalidUpdate(_) => "INVALID_UPDATE",
            VaultError::MissingIdentityKey(_) => "MISSING_IDENTITY_KEY",
            VaultError::NotFound => "NOT_FOUND",
            VaultError::VaultNotFound(_) => "VAULT_NOT_FOUND",
            VaultError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            VaultError::Timeout(_) => "TIMEOUT",
            VaultError::IngestFailed(_) => "INGEST_FAILED",
            VaultError::PathTraversal(_) => "PATH_TRAVERSAL",
            VaultError::Io(_) => "IO_ERROR",
            VaultError::Internal(_) => "UNKNOWN",
        }
    }
}
