//! A single closed error-kind taxonomy rather than a grab-bag of ad-hoc
//! string errors. Every fallible operation in the data path returns
//! `Result<_, ServiceError>` (or a narrower type that maps onto one) so
//! that the propagation policy — origin errors surface, persistence
//! errors are swallowed, framing errors tear down the session, one
//! correlation id's failure never touches another's — is enforced by
//! the type system at call sites instead of by convention.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("subdomain unknown")]
    NotFound,

    #[error("tunnel has no active session")]
    TunnelDisconnected,

    #[error("origin refused the connection")]
    ConnectionRefused,

    #[error("origin did not respond within the deadline")]
    LocalTimeout,

    #[error("origin error: {0}")]
    LocalError(String),

    #[error("origin sent a malformed response")]
    BadResponse,

    #[error("wire framing violation: {0}")]
    ProtocolError(String),

    #[error("subdomain already in use by an active session")]
    SubdomainConflict,

    #[error("tunnel id already belongs to a live session")]
    TunnelIdConflict,

    #[error("no free subdomain after exhausting retries")]
    SubdomainExhausted,

    #[error("no free port in the configured L4 range")]
    PortExhausted,

    #[error("persistence backend unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("handshake rejected: unauthorized")]
    Unauthorized,

    #[error("tunnel record not found")]
    TunnelRecordNotFound,

    #[error("request record not found")]
    RequestRecordNotFound,
}

impl ServiceError {
    /// The HTTP status this error maps to when surfaced on the public
    /// proxy path.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::NotFound => 404,
            ServiceError::TunnelDisconnected => 503,
            ServiceError::ConnectionRefused => 502,
            ServiceError::LocalTimeout => 504,
            ServiceError::LocalError(_) => 502,
            ServiceError::BadResponse => 502,
            ServiceError::Unauthorized => 401,
            ServiceError::SubdomainConflict | ServiceError::SubdomainExhausted | ServiceError::TunnelIdConflict => 409,
            ServiceError::PortExhausted => 503,
            ServiceError::TunnelRecordNotFound | ServiceError::RequestRecordNotFound => 404,
            ServiceError::ProtocolError(_) => 500,
            ServiceError::PersistenceUnavailable(_) => 500,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Lets admin handlers `?`-propagate a `ServiceError` straight into an
/// axum response — the status comes from `http_status`, the body is
/// `{"error": "..."}` (admin error shape).
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
