//! Error taxonomy
//!
//! Every failure surfaced by the core carries a stable code and a
//! human-readable detail. `Stale` is recovered locally by the matching
//! loop; everything else propagates to the caller.

use axum::http::StatusCode;
use uuid::Uuid;

/// Core error type
#[derive(Debug, thiserror::Error)]
pub enum OesError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("insufficient position: {0}")]
    InsufficientPosition(String),

    #[error("order cannot be fully filled at the limit price")]
    NotFillable,

    #[error("{0}")]
    InvalidAmend(String),

    #[error("unknown order: {0}")]
    UnknownOrder(Uuid),

    #[error("order {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    /// Lost a race against a concurrent mutation; retryable.
    #[error("concurrent modification, retry")]
    Stale,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OesError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            OesError::Validation(_) => "VALIDATION",
            OesError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            OesError::InsufficientPosition(_) => "INSUFFICIENT_POSITION",
            OesError::NotFillable => "NOT_FILLABLE",
            OesError::InvalidAmend(_) => "INVALID_AMEND",
            OesError::UnknownOrder(_) => "UNKNOWN_ORDER",
            OesError::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            OesError::Stale => "STALE",
            OesError::Unavailable(_) => "UNAVAILABLE",
            OesError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status the error maps to at the API boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            OesError::Validation(_) | OesError::InvalidAmend(_) => StatusCode::BAD_REQUEST,
            OesError::InsufficientFunds(_)
            | OesError::InsufficientPosition(_)
            | OesError::NotFillable => StatusCode::UNPROCESSABLE_ENTITY,
            OesError::UnknownOrder(_) => StatusCode::NOT_FOUND,
            OesError::AlreadyTerminal(_) => StatusCode::CONFLICT,
            OesError::Stale => StatusCode::CONFLICT,
            OesError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OesError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(OesError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(OesError::NotFillable.code(), "NOT_FILLABLE");
        assert_eq!(OesError::Stale.code(), "STALE");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(OesError::UnknownOrder(Uuid::nil()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            OesError::Unavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
