use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common_http_errors::ApiError;
use common_money::Points;
use common_security::{ensure_actor, ActorContext, ActorCtxExtractor, ActorType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::postgres::PgConnection;
use tracing::{error, warn};
use uuid::Uuid;

use crate::app::{idempotency_key_from_headers, snapshot_response, AppState, CAPTURES_TOTAL};
use crate::capture::{self, CaptureOutcome, CaptureRequest};
use crate::events::WalletEvent;
use crate::gateway::PinOutcome;
use crate::idempotency::{self, Gate, RETRY_AFTER_SECS};
use crate::intents::{self, IntentStatus, INTENT_TTL_SECS};
use crate::ledger::{LedgerError, OrderLine, TransactionType};
use crate::settlement;

#[derive(Debug, Deserialize)]
pub struct OrderItemRequest {
    pub menu_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub pin: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntentItemView {
    pub menu_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntentDetailResponse {
    pub public_id: Uuid,
    pub qr_token_id: Uuid,
    pub store_id: Uuid,
    pub customer_id: Uuid,
    pub wallet_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub use_transaction_id: Option<Uuid>,
    pub items: Vec<IntentItemView>,
}

/// QR token as issued by the token service; read-only here.
#[derive(Debug, sqlx::FromRow)]
struct QrToken {
    pub mode: String,
    pub bound_store_id: Uuid,
    pub customer_id: Uuid,
    pub wallet_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MenuRow {
    pub id: Uuid,
    pub store_id: Uuid,
    pub name: String,
    pub price: i64,
    pub available: bool,
}

fn detail_from(intent: intents::PaymentIntent, items: Vec<intents::PaymentIntentItem>) -> IntentDetailResponse {
    // A stored PENDING past its expiry reads as EXPIRED before any sweep.
    let status = if intent.status == "PENDING" && intents::is_past_expiry(intent.expires_at, Utc::now()) {
        "EXPIRED".to_string()
    } else {
        intent.status.clone()
    };
    IntentDetailResponse {
        public_id: intent.public_id,
        qr_token_id: intent.qr_token_id,
        store_id: intent.store_id,
        customer_id: intent.customer_id,
        wallet_id: intent.wallet_id,
        amount: intent.amount,
        status,
        created_at: intent.created_at,
        expires_at: intent.expires_at,
        approved_at: intent.approved_at,
        completed_at: intent.completed_at,
        declined_at: intent.declined_at,
        canceled_at: intent.canceled_at,
        use_transaction_id: intent.use_transaction_id,
        items: items
            .into_iter()
            .map(|i| IntentItemView {
                menu_id: i.menu_id,
                name: i.name,
                unit_price: i.unit_price,
                quantity: i.quantity,
            })
            .collect(),
    }
}

async fn load_detail(
    conn: &mut PgConnection,
    public_id: Uuid,
) -> Result<Option<IntentDetailResponse>, sqlx::Error> {
    let Some(intent) = intents::get_by_public_id(conn, public_id).await? else {
        return Ok(None);
    };
    let items = intents::items_for_intent(conn, intent.id).await?;
    Ok(Some(detail_from(intent, items)))
}

/// POST /cpqr/:qr_token_id/initiate
pub async fn initiate_intent(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path(qr_token_id): Path<Uuid>,
    headers: HeaderMap,
    Json(raw_body): Json<Value>,
) -> Result<Response, ApiError> {
    ensure_actor(&actor, ActorType::Merchant)?;
    let trace = actor.trace_id;
    let key = idempotency_key_from_headers(&headers)?;
    let req: InitiateRequest = serde_json::from_value(raw_body.clone()).map_err(|e| {
        ApiError::BadRequest { code: "invalid_body", trace_id: trace, message: Some(e.to_string()) }
    })?;
    let body_hash = idempotency::canonical_body_hash(&raw_body);
    let method_path = format!("POST /cpqr/{qr_token_id}/initiate");

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let gate = idempotency::gate(&mut conn, &actor, &method_path, key, &body_hash)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    match gate {
        Gate::InFlight => Err(ApiError::InProgress { retry_after_secs: RETRY_AFTER_SECS, trace_id: trace }),
        Gate::BodyConflict => Err(ApiError::conflict("idempotency_body_conflict", trace)),
        Gate::Replay { status, body } => Ok(snapshot_response(status, body)),
        Gate::ReplayByResource { status, resource_public_id } => {
            let public_id = resource_public_id
                .ok_or_else(|| ApiError::internal("replay record lost its resource id", trace))?;
            let detail = load_detail(&mut conn, public_id)
                .await
                .map_err(|e| ApiError::internal(e, trace))?
                .ok_or_else(|| ApiError::internal("replay resource vanished", trace))?;
            let body = serde_json::to_value(&detail).map_err(|e| ApiError::internal(e, trace))?;
            Ok(snapshot_response(status, body))
        }
        Gate::Fresh(record) => match initiate_inner(&state, &actor, qr_token_id, &req).await {
            Ok(detail) => {
                let public_id = detail.public_id;
                match serde_json::to_value(&detail) {
                    Ok(body) => {
                        idempotency::complete(&mut conn, record.id, 201, &body, Some(public_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(201, body))
                    }
                    Err(err) => {
                        // degraded: work committed, snapshot did not
                        warn!(error = %err, %public_id, "intent snapshot serialization failed");
                        idempotency::complete_without_snapshot(&mut conn, record.id, 201, Some(public_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok((StatusCode::CREATED, Json(detail)).into_response())
                    }
                }
            }
            Err(api_err) => {
                let _ = idempotency::release(&mut conn, record.id).await;
                Err(api_err)
            }
        },
    }
}

async fn initiate_inner(
    state: &AppState,
    actor: &ActorContext,
    qr_token_id: Uuid,
    req: &InitiateRequest,
) -> Result<IntentDetailResponse, ApiError> {
    let trace = actor.trace_id;
    let store_id = actor.actor_id;

    if req.items.is_empty() {
        return Err(ApiError::BadRequest {
            code: "empty_order",
            trace_id: trace,
            message: Some("Order must include at least one item".into()),
        });
    }
    for item in &req.items {
        if item.quantity <= 0 {
            return Err(ApiError::BadRequest {
                code: "invalid_quantity",
                trace_id: trace,
                message: Some(format!("Quantity for menu {} must be positive", item.menu_id)),
            });
        }
    }

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let token = sqlx::query_as::<_, QrToken>(
        "SELECT mode, bound_store_id, customer_id, wallet_id, expires_at, state
         FROM qr_tokens WHERE id = $1",
    )
    .bind(qr_token_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, trace))?
    .ok_or(ApiError::NotFound { code: "qr_not_found", trace_id: trace })?;

    if token.state != "ACTIVE" {
        return Err(ApiError::bad_request("qr_invalid_state", trace));
    }
    if token.mode != "PAYMENT" {
        return Err(ApiError::bad_request("qr_mode_mismatch", trace));
    }
    if token.expires_at <= Utc::now() {
        return Err(ApiError::bad_request("qr_expired", trace));
    }
    if token.bound_store_id != store_id {
        return Err(ApiError::bad_request("qr_store_mismatch", trace));
    }

    // Price snapshot: read the live menu exactly once, here. Client-supplied
    // amounts are never part of the request.
    let mut menu_ids: Vec<Uuid> = req.items.iter().map(|i| i.menu_id).collect();
    menu_ids.sort();
    menu_ids.dedup();
    let menus = sqlx::query_as::<_, MenuRow>(
        "SELECT id, store_id, name, price, available FROM menus WHERE id = ANY($1)",
    )
    .bind(&menu_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;

    let mut lines: Vec<OrderLine> = Vec::with_capacity(req.items.len());
    let mut total: i64 = 0;
    for item in &req.items {
        let menu = menus
            .iter()
            .find(|m| m.id == item.menu_id)
            .filter(|m| m.store_id == store_id && m.available)
            .ok_or_else(|| ApiError::BadRequest {
                code: "menu_item_unavailable",
                trace_id: trace,
                message: Some(format!("Menu item {} is not orderable", item.menu_id)),
            })?;
        let line_total = menu
            .price
            .checked_mul(item.quantity as i64)
            .ok_or(ApiError::bad_request("invalid_amount", trace))?;
        total = total
            .checked_add(line_total)
            .ok_or(ApiError::bad_request("invalid_amount", trace))?;
        lines.push(OrderLine {
            menu_id: menu.id,
            name: menu.name.clone(),
            unit_price: menu.price,
            quantity: item.quantity,
        });
    }
    let amount = Points::positive(total).map_err(|_| ApiError::bad_request("invalid_amount", trace))?;

    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;
    let intent_id = Uuid::new_v4();
    let public_id = Uuid::new_v4();
    // One intent per QR token; the unique binding loses the race, not the
    // last writer.
    let created: Option<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "INSERT INTO payment_intents
           (id, public_id, qr_token_id, customer_id, store_id, wallet_id, amount, status,
            created_at, expires_at, version)
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', NOW(), NOW() + ($8 * INTERVAL '1 second'), 0)
         ON CONFLICT (qr_token_id) DO NOTHING
         RETURNING created_at, expires_at",
    )
    .bind(intent_id)
    .bind(public_id)
    .bind(qr_token_id)
    .bind(token.customer_id)
    .bind(store_id)
    .bind(token.wallet_id)
    .bind(amount.raw())
    .bind(INTENT_TTL_SECS)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    let Some((created_at, expires_at)) = created else {
        return Err(ApiError::conflict("qr_already_bound", trace));
    };

    for line in &lines {
        sqlx::query(
            "INSERT INTO payment_intent_items (id, intent_id, menu_id, name, unit_price, quantity)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(intent_id)
        .bind(line.menu_id)
        .bind(&line.name)
        .bind(line.unit_price)
        .bind(line.quantity)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    }
    tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;

    Ok(IntentDetailResponse {
        public_id,
        qr_token_id,
        store_id,
        customer_id: token.customer_id,
        wallet_id: token.wallet_id,
        amount: amount.raw(),
        status: "PENDING".into(),
        created_at,
        expires_at,
        approved_at: None,
        completed_at: None,
        declined_at: None,
        canceled_at: None,
        use_transaction_id: None,
        items: lines
            .into_iter()
            .map(|l| IntentItemView {
                menu_id: l.menu_id,
                name: l.name,
                unit_price: l.unit_price,
                quantity: l.quantity,
            })
            .collect(),
    })
}

enum ApprovalResult {
    Completed(Box<IntentDetailResponse>),
    /// Insufficient funds moved the intent to DECLINED; the response is a
    /// recorded outcome and replays must return it as-is.
    Declined(Value),
}

/// POST /payments/:public_id/approve
pub async fn approve_intent(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path(public_id): Path<Uuid>,
    headers: HeaderMap,
    Json(raw_body): Json<Value>,
) -> Result<Response, ApiError> {
    ensure_actor(&actor, ActorType::Customer)?;
    let trace = actor.trace_id;
    let key = idempotency_key_from_headers(&headers)?;
    let req: ApproveRequest = serde_json::from_value(raw_body.clone()).map_err(|e| {
        ApiError::BadRequest { code: "invalid_body", trace_id: trace, message: Some(e.to_string()) }
    })?;
    let body_hash = idempotency::canonical_body_hash(&raw_body);
    let method_path = format!("POST /payments/{public_id}/approve");

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let gate = idempotency::gate(&mut conn, &actor, &method_path, key, &body_hash)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    match gate {
        Gate::InFlight => Err(ApiError::InProgress { retry_after_secs: RETRY_AFTER_SECS, trace_id: trace }),
        Gate::BodyConflict => Err(ApiError::conflict("idempotency_body_conflict", trace)),
        Gate::Replay { status, body } => Ok(snapshot_response(status, body)),
        Gate::ReplayByResource { status, resource_public_id } => {
            let pid = resource_public_id
                .ok_or_else(|| ApiError::internal("replay record lost its resource id", trace))?;
            let detail = load_detail(&mut conn, pid)
                .await
                .map_err(|e| ApiError::internal(e, trace))?
                .ok_or_else(|| ApiError::internal("replay resource vanished", trace))?;
            let body = serde_json::to_value(&detail).map_err(|e| ApiError::internal(e, trace))?;
            Ok(snapshot_response(status, body))
        }
        Gate::Fresh(record) => match approve_inner(&state, &actor, public_id, &req.pin).await {
            Ok(ApprovalResult::Completed(detail)) => {
                match serde_json::to_value(detail.as_ref()) {
                    Ok(body) => {
                        idempotency::complete(&mut conn, record.id, 200, &body, Some(public_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(200, body))
                    }
                    Err(err) => {
                        warn!(error = %err, %public_id, "approval snapshot serialization failed");
                        idempotency::complete_without_snapshot(&mut conn, record.id, 200, Some(public_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok((StatusCode::OK, Json(detail.as_ref())).into_response())
                    }
                }
            }
            Ok(ApprovalResult::Declined(body)) => {
                idempotency::complete(&mut conn, record.id, 400, &body, Some(public_id))
                    .await
                    .map_err(|e| ApiError::internal(e, trace))?;
                Ok(snapshot_response(400, body))
            }
            Err(api_err) => {
                let _ = idempotency::release(&mut conn, record.id).await;
                Err(api_err)
            }
        },
    }
}

async fn approve_inner(
    state: &AppState,
    actor: &ActorContext,
    public_id: Uuid,
    pin: &str,
) -> Result<ApprovalResult, ApiError> {
    let trace = actor.trace_id;

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let intent = intents::get_by_public_id(&mut conn, public_id)
        .await
        .map_err(|e| ApiError::internal(e, trace))?
        .ok_or(ApiError::NotFound { code: "intent_not_found", trace_id: trace })?;

    if intent.customer_id != actor.actor_id {
        return Err(ApiError::Forbidden { trace_id: trace });
    }
    if IntentStatus::from_str(&intent.status) != Some(IntentStatus::Pending) {
        return Err(ApiError::bad_request("intent_not_pending", trace));
    }
    if intents::is_past_expiry(intent.expires_at, Utc::now()) {
        // persist lazily; losing this race is fine, the read already decided
        let _ = intents::try_transition(
            &mut conn,
            intent.id,
            IntentStatus::Pending,
            IntentStatus::Expired,
            intent.version,
        )
        .await;
        return Err(ApiError::bad_request("intent_expired", trace));
    }

    // PIN check is delegated; an unreachable PIN service leaves the intent
    // PENDING for a manual retry rather than declining it.
    match state.pin.verify(intent.customer_id, pin).await {
        Err(err) => {
            return Err(ApiError::bad_gateway("pin_service_unavailable", err, trace));
        }
        Ok(PinOutcome::Locked) => return Err(ApiError::bad_request("pin_locked", trace)),
        Ok(PinOutcome::Invalid) => return Err(ApiError::bad_request("pin_invalid", trace)),
        Ok(PinOutcome::Valid) => {}
    }
    drop(conn);

    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;
    if !intents::try_transition(
        &mut tx,
        intent.id,
        IntentStatus::Pending,
        IntentStatus::Approved,
        intent.version,
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?
    {
        // a concurrent approval/decline won; the caller retries
        return Err(ApiError::conflict("version_conflict", trace));
    }

    let items = intents::items_for_intent(&mut tx, intent.id)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    let lines: Vec<OrderLine> = items
        .iter()
        .map(|i| OrderLine {
            menu_id: i.menu_id,
            name: i.name.clone(),
            unit_price: i.unit_price,
            quantity: i.quantity,
        })
        .collect();

    let capture_req = CaptureRequest {
        wallet_id: intent.wallet_id,
        customer_id: intent.customer_id,
        store_id: intent.store_id,
        amount: Points::from_raw(intent.amount),
        tx_type: TransactionType::Use,
        lines,
    };
    match capture::capture(&mut tx, &capture_req, &state.spend_policy).await {
        Ok(CaptureOutcome::Captured { transaction_id }) => {
            if !intents::complete_with_transaction(&mut tx, intent.id, intent.version + 1, transaction_id)
                .await
                .map_err(|e| ApiError::internal(e, trace))?
            {
                return Err(ApiError::internal("intent moved during approval", trace));
            }
            settlement::enqueue_task(&mut tx, transaction_id, intent.store_id, intent.amount)
                .await
                .map_err(|e| ApiError::internal(e, trace))?;
            tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;

            CAPTURES_TOTAL.with_label_values(&["captured"]).inc();
            state.events.publish(WalletEvent::new(
                intent.customer_id,
                "PAYMENT_COMPLETED",
                format!("Payment of {} points at store {} completed", intent.amount, intent.store_id),
            ));

            let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
            let detail = load_detail(&mut conn, public_id)
                .await
                .map_err(|e| ApiError::internal(e, trace))?
                .ok_or_else(|| ApiError::internal("completed intent vanished", trace))?;
            Ok(ApprovalResult::Completed(Box::new(detail)))
        }
        Ok(CaptureOutcome::InsufficientFunds) => {
            // roll back the APPROVED transition, then decline; wallet state
            // was never touched.
            drop(tx);
            CAPTURES_TOTAL.with_label_values(&["insufficient_funds"]).inc();
            let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
            if !intents::try_transition(
                &mut conn,
                intent.id,
                IntentStatus::Pending,
                IntentStatus::Declined,
                intent.version,
            )
            .await
            .map_err(|e| ApiError::internal(e, trace))?
            {
                return Err(ApiError::conflict("version_conflict", trace));
            }
            Ok(ApprovalResult::Declined(json!({
                "code": "insufficient_funds",
                "intent_public_id": public_id,
                "status": "DECLINED",
            })))
        }
        Ok(CaptureOutcome::PolicyViolation { code }) => {
            drop(tx);
            CAPTURES_TOTAL.with_label_values(&["policy_violation"]).inc();
            Err(ApiError::bad_request(code, trace))
        }
        Err(err) => {
            drop(tx);
            match &err {
                LedgerError::Db(db) => error!(error = %db, %public_id, "capture failed"),
                invariant => error!(error = %invariant, %public_id, "capture invariant violation"),
            }
            Err(ApiError::internal("capture failed", trace))
        }
    }
}

/// GET /api/payments/intent/:public_id
pub async fn get_intent_detail(
    State(state): State<AppState>,
    Path(public_id): Path<Uuid>,
) -> Result<Json<IntentDetailResponse>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, None))?;
    let intent = intents::get_by_public_id(&mut conn, public_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or(ApiError::NotFound { code: "intent_not_found", trace_id: None })?;

    if intent.status == "PENDING" && intents::is_past_expiry(intent.expires_at, Utc::now()) {
        let _ = intents::try_transition(
            &mut conn,
            intent.id,
            IntentStatus::Pending,
            IntentStatus::Expired,
            intent.version,
        )
        .await;
    }
    let items = intents::items_for_intent(&mut conn, intent.id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(Json(detail_from(intent, items)))
}
