use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap};
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use tracing::{warn, Span};
use uuid::Uuid;

/// Who is calling. Authentication itself happens upstream (session gateway);
/// the verified identity reaches this service as headers. The pair
/// (actor_type, actor_id) scopes every idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActorType {
    Merchant,
    Customer,
    Admin,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Merchant => "MERCHANT",
            ActorType::Customer => "CUSTOMER",
            ActorType::Admin => "ADMIN",
        }
    }

    pub fn from_str(s: &str) -> Option<ActorType> {
        match s {
            "MERCHANT" | "merchant" => Some(ActorType::Merchant),
            "CUSTOMER" | "customer" => Some(ActorType::Customer),
            "ADMIN" | "admin" => Some(ActorType::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_type: ActorType,
    pub actor_id: Uuid,
    pub trace_id: Option<Uuid>,
}

pub struct ActorCtxExtractor(pub ActorContext);

fn actor_type_from_headers(headers: &HeaderMap) -> Option<ActorType> {
    headers
        .get("X-Actor-Type")
        .and_then(|v| v.to_str().ok())
        .and_then(ActorType::from_str)
}

fn actor_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("X-Actor-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn trace_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("X-Trace-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorCtxExtractor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let actor_type = actor_type_from_headers(headers).ok_or_else(|| ApiError::BadRequest {
            code: "missing_actor_type",
            trace_id: None,
            message: Some("Missing or invalid X-Actor-Type header".into()),
        })?;
        let actor_id = actor_id_from_headers(headers).ok_or_else(|| ApiError::BadRequest {
            code: "missing_actor_id",
            trace_id: None,
            message: Some("Missing or invalid X-Actor-ID header".into()),
        })?;
        let trace_id = trace_id_from_headers(headers).or_else(|| Some(Uuid::new_v4()));

        Span::current().record("actor_id", tracing::field::display(actor_id));
        if let Some(tid) = trace_id.as_ref() {
            Span::current().record("trace_id", tracing::field::display(tid));
        }

        Ok(ActorCtxExtractor(ActorContext {
            actor_type,
            actor_id,
            trace_id,
        }))
    }
}

pub fn ensure_actor(ctx: &ActorContext, required: ActorType) -> Result<(), ApiError> {
    if ctx.actor_type == required {
        return Ok(());
    }
    warn!(actor_id = %ctx.actor_id, actor_type = ?ctx.actor_type, ?required, "actor_kind_check_failed");
    Err(ApiError::ForbiddenWrongActor {
        required: required.as_str(),
        trace_id: ctx.trace_id,
    })
}
