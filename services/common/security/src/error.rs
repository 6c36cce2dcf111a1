use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("missing actor identity")]       MissingActor,
    #[error("malformed actor identity")]     InvalidActor,
    #[error("unauthorized - wrong actor kind")] Forbidden,
    #[error("internal security error")]      Internal,
}

impl From<SecurityError> for (StatusCode, String) {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::MissingActor => (StatusCode::BAD_REQUEST, e.to_string()),
            SecurityError::InvalidActor => (StatusCode::BAD_REQUEST, e.to_string()),
            SecurityError::Forbidden => (StatusCode::FORBIDDEN, e.to_string()),
            SecurityError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}
