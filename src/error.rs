//! Service-level error taxonomy.
//!
//! Every fallible operation that crosses the tool-call surface resolves to a
//! [`ServiceError`], which carries a stable JSON-RPC error code and an HTTP
//! status. Internal plumbing uses `anyhow` and is converted to
//! [`ServiceError::Store`] at the store boundary.

use thiserror::Error;

use crate::provider::ProviderErrorKind;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing, invalid, or expired bearer token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The token's tenant does not own the targeted resource.
    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),

    /// Unknown unit, session, or event id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed tool input or an invalid filter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation illegal for the session's current state.
    #[error("session state: {0}")]
    SessionState(String),

    /// Upstream LLM/embedding failure after retries were exhausted.
    #[error("provider error ({kind:?}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// Index or disk failure; the partial write has been rolled back.
    #[error("store error: {0}")]
    Store(String),

    /// The request deadline fired before the operation completed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl ServiceError {
    /// The JSON-RPC error code used on the MCP surface.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::Auth(_) => -32001,
            Self::TenantMismatch(_) => -32002,
            Self::NotFound(_) => -32003,
            Self::InvalidArgument(_) => -32602,
            Self::SessionState(_) => -32004,
            Self::Provider { .. } => -32010,
            Self::Store(_) => -32020,
            Self::DeadlineExceeded(_) => -32030,
        }
    }

    /// The HTTP status used on the REST surface.
    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::TenantMismatch(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::SessionState(_) => StatusCode::CONFLICT,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<crate::provider::ProviderError> for ServiceError {
    fn from(err: crate::provider::ProviderError) -> Self {
        Self::Provider {
            kind: err.kind,
            message: err.message,
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rpc_codes_match_contract() {
        assert_eq!(ServiceError::Auth("x".into()).json_rpc_code(), -32001);
        assert_eq!(
            ServiceError::TenantMismatch("x".into()).json_rpc_code(),
            -32002
        );
        assert_eq!(ServiceError::NotFound("x".into()).json_rpc_code(), -32003);
        assert_eq!(
            ServiceError::InvalidArgument("x".into()).json_rpc_code(),
            -32602
        );
        assert_eq!(
            ServiceError::SessionState("x".into()).json_rpc_code(),
            -32004
        );
        assert_eq!(
            ServiceError::Provider {
                kind: ProviderErrorKind::Permanent,
                message: "x".into()
            }
            .json_rpc_code(),
            -32010
        );
        assert_eq!(ServiceError::Store("x".into()).json_rpc_code(), -32020);
        assert_eq!(
            ServiceError::DeadlineExceeded("x".into()).json_rpc_code(),
            -32030
        );
    }

    #[test]
    fn http_statuses() {
        use axum::http::StatusCode;
        assert_eq!(
            ServiceError::Auth("x".into()).http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::TenantMismatch("x".into()).http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::NotFound("x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
    }
}
