//! Error taxonomy for the audit control plane.
//!
//! Every public operation on a component returns either a value or one of
//! these variants. `AuditError` maps directly onto the HTTP status codes in
//! the transport layer; see `http::routes` for the mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("quota exceeded for client")]
    QuotaExceeded,

    #[error("queue capacity exceeded")]
    CapacityExceeded,

    #[error("required dependency missing: {0}")]
    DependencyMissing(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuditError {
    /// HTTP status code this error maps to, per the error handling design.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationFailed(_) => 400,
            Self::QuotaExceeded => 429,
            Self::CapacityExceeded => 503,
            Self::DependencyMissing(_) => 503,
            Self::UpstreamFailure(_) | Self::Timeout(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
