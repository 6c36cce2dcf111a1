use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub required_actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
pub enum ApiError {
    ForbiddenWrongActor { required: &'static str, trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    /// 409: idempotency body-hash mismatch or optimistic-lock loss. Client
    /// misuse or a retryable race, never server state corruption.
    Conflict { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    /// 202 + Retry-After: the idempotency key is held by another in-flight
    /// request; the caller retries, nothing executed twice.
    InProgress { retry_after_secs: u64, trace_id: Option<Uuid> },
    /// 502: an external collaborator (bank, PIN service) failed.
    BadGateway { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn conflict(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::Conflict { code, trace_id, message: None } }
    pub fn bad_gateway<E: std::fmt::Display>(code: &'static str, e: E, trace_id: Option<Uuid>) -> Self {
        Self::BadGateway { code, trace_id, message: Some(e.to_string()) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code, retry_after) = match self {
            ApiError::ForbiddenWrongActor { required, trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "wrong_actor".into(), required_actor: Some(required.into()), trace_id, message: None, retry_after_secs: None },
                "wrong_actor",
                None,
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "forbidden".into(), required_actor: None, trace_id, message: None, retry_after_secs: None },
                "forbidden",
                None,
            ),
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), required_actor: None, trace_id, message, retry_after_secs: None },
                code,
                None,
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), required_actor: None, trace_id, message: None, retry_after_secs: None },
                code,
                None,
            ),
            ApiError::Conflict { code, trace_id, message } => (
                StatusCode::CONFLICT,
                ErrorBody { code: code.into(), required_actor: None, trace_id, message, retry_after_secs: None },
                code,
                None,
            ),
            ApiError::InProgress { retry_after_secs, trace_id } => (
                StatusCode::ACCEPTED,
                ErrorBody { code: "in_progress".into(), required_actor: None, trace_id, message: None, retry_after_secs: Some(retry_after_secs) },
                "in_progress",
                Some(retry_after_secs),
            ),
            ApiError::BadGateway { code, trace_id, message } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody { code: code.into(), required_actor: None, trace_id, message, retry_after_secs: None },
                code,
                None,
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), required_actor: None, trace_id, message, retry_after_secs: None },
                "internal_error",
                None,
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(axum::http::header::RETRY_AFTER, val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_in_progress_sets_retry_after() {
        let resp = ApiError::InProgress { retry_after_secs: 3, trace_id: None }.into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "3");
        assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "in_progress");
    }

    #[test]
    fn test_conflict_carries_code_header() {
        let resp = ApiError::conflict("idempotency_body_conflict", None).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            resp.headers().get("X-Error-Code").unwrap(),
            "idempotency_body_conflict"
        );
    }
}
