use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use common_http_errors::ApiError;
use common_money::Points;
use common_security::{ensure_actor, ActorContext, ActorCtxExtractor, ActorType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::app::{idempotency_key_from_headers, snapshot_response, AppState};
use crate::capture::{self, CaptureOutcome, CaptureRequest};
use crate::events::WalletEvent;
use crate::gateway::external_reference;
use crate::idempotency::{self, Gate, RETRY_AFTER_SECS};
use crate::ledger::{
    self, LotSourceType, NewLot, NewTransaction, TransactionType, Wallet, WalletStoreLot,
};

#[derive(Debug, Deserialize)]
pub struct ChargeRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub transaction_id: Uuid,
    pub wallet_id: Uuid,
    pub store_id: Uuid,
    pub amount: i64,
    pub external_transaction_id: Option<String>,
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub target_wallet_id: Uuid,
    pub store_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub out_transaction_id: Uuid,
    pub in_transaction_id: Uuid,
    pub source_wallet_id: Uuid,
    pub target_wallet_id: Uuid,
    pub store_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LotView {
    pub id: Uuid,
    pub amount_remaining: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub wallet_id: Uuid,
    pub store_id: Uuid,
    pub balance: i64,
    pub lots: Vec<LotView>,
}

async fn load_owned_wallet(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    actor: &ActorContext,
) -> Result<Wallet, ApiError> {
    let trace = actor.trace_id;
    let wallet = sqlx::query_as::<_, Wallet>(
        "SELECT id, owner_type, owner_id, created_at FROM wallets WHERE id = $1",
    )
    .bind(wallet_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, trace))?
    .ok_or(ApiError::NotFound { code: "wallet_not_found", trace_id: trace })?;

    // Individual wallets belong to exactly one customer. Group wallet
    // membership is enforced by the group service upstream.
    if wallet.owner_type == "CUSTOMER" && wallet.owner_id != actor.actor_id {
        return Err(ApiError::Forbidden { trace_id: trace });
    }
    Ok(wallet)
}

/// POST /api/wallets/:wallet_id/stores/:store_id/charge
pub async fn charge_wallet(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path((wallet_id, store_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(raw_body): Json<Value>,
) -> Result<Response, ApiError> {
    ensure_actor(&actor, ActorType::Customer)?;
    let trace = actor.trace_id;
    let key = idempotency_key_from_headers(&headers)?;
    let req: ChargeRequest = serde_json::from_value(raw_body.clone()).map_err(|e| {
        ApiError::BadRequest { code: "invalid_body", trace_id: trace, message: Some(e.to_string()) }
    })?;
    let body_hash = idempotency::canonical_body_hash(&raw_body);
    let method_path = format!("POST /api/wallets/{wallet_id}/stores/{store_id}/charge");

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let gate = idempotency::gate(&mut conn, &actor, &method_path, key, &body_hash)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    match gate {
        Gate::InFlight => Err(ApiError::InProgress { retry_after_secs: RETRY_AFTER_SECS, trace_id: trace }),
        Gate::BodyConflict => Err(ApiError::conflict("idempotency_body_conflict", trace)),
        Gate::Replay { status, body } => Ok(snapshot_response(status, body)),
        Gate::ReplayByResource { status, resource_public_id } => {
            let tx_id = resource_public_id
                .ok_or_else(|| ApiError::internal("replay record lost its resource id", trace))?;
            let body = load_charge_result(&mut conn, tx_id)
                .await?
                .ok_or_else(|| ApiError::internal("replayed charge vanished", trace))?;
            Ok(snapshot_response(status, body))
        }
        Gate::Fresh(record) => match charge_inner(&state, &actor, wallet_id, store_id, &req).await {
            Ok(resp) => {
                let tx_id = resp.transaction_id;
                match serde_json::to_value(&resp) {
                    Ok(body) => {
                        idempotency::complete(&mut conn, record.id, 201, &body, Some(tx_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(201, body))
                    }
                    Err(err) => {
                        warn!(error = %err, %tx_id, "charge snapshot serialization failed");
                        idempotency::complete_without_snapshot(&mut conn, record.id, 201, Some(tx_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(201, serde_json::to_value(&resp).unwrap_or_default()))
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

async fn load_charge_result(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Option<Value>, ApiError> {
    let row = sqlx::query_as::<_, ledger::LedgerTransaction>(
        "SELECT id, wallet_id, customer_id, store_id, tx_type, amount, created_at, ref_transaction_id
         FROM transactions WHERE id = $1",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    let Some(tx) = row else { return Ok(None) };
    let balance: Option<i64> = sqlx::query_scalar(
        "SELECT balance FROM wallet_store_balances WHERE wallet_id = $1 AND store_id = $2",
    )
    .bind(tx.wallet_id)
    .bind(tx.store_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    let resp = ChargeResponse {
        transaction_id: tx.id,
        wallet_id: tx.wallet_id,
        store_id: tx.store_id,
        amount: tx.amount,
        external_transaction_id: None,
        balance: balance.unwrap_or(0),
    };
    serde_json::to_value(&resp)
        .map(Some)
        .map_err(|e| ApiError::internal(e, None))
}

async fn charge_inner(
    state: &AppState,
    actor: &ActorContext,
    wallet_id: Uuid,
    store_id: Uuid,
    req: &ChargeRequest,
) -> Result<ChargeResponse, ApiError> {
    let trace = actor.trace_id;
    let amount = Points::positive(req.amount)
        .map_err(|_| ApiError::bad_request("invalid_amount", trace))?;

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    load_owned_wallet(&mut conn, wallet_id, actor).await?;
    drop(conn);

    // Card payment first; nothing lands in the ledger unless the bank said
    // yes. The reference number survives restarts, so a crash between the
    // bank call and the commit is reconcilable from the bank statement.
    let reference = external_reference();
    let approval = match state.bank.request_card_payment(&reference, amount.raw()).await {
        Ok(approval) => approval,
        Err(err) => return Err(ApiError::bad_gateway("bank_unavailable", err, trace)),
    };
    if !approval.success {
        return Err(ApiError::bad_request("card_declined", trace));
    }

    let (charge_tx_id, balance) = match record_charge(state, actor, wallet_id, store_id, amount).await {
        Ok(done) => done,
        Err(err) => {
            // The card was charged but the ledger write failed: compensate
            // with a card cancel; if that also fails, the stored reference
            // makes the charge reconcilable from the bank statement.
            if let Some(ext) = approval.external_transaction_id.as_deref() {
                if let Err(cancel_err) = state.bank.request_card_cancel(ext).await {
                    tracing::error!(
                        error = %cancel_err,
                        external_transaction_id = ext,
                        reference = %reference,
                        "card cancel after failed charge write also failed"
                    );
                }
            }
            return Err(err);
        }
    };

    state.events.publish(WalletEvent::new(
        actor.actor_id,
        "CHARGE_COMPLETED",
        format!("Charged {} points for store {}", amount, store_id),
    ));

    Ok(ChargeResponse {
        transaction_id: charge_tx_id,
        wallet_id,
        store_id,
        amount: amount.raw(),
        external_transaction_id: approval.external_transaction_id,
        balance,
    })
}

/// The ledger side of a charge: CHARGE transaction, its lot, the positive
/// move and the balance upsert, all or nothing.
async fn record_charge(
    state: &AppState,
    actor: &ActorContext,
    wallet_id: Uuid,
    store_id: Uuid,
    amount: Points,
) -> Result<(Uuid, i64), ApiError> {
    let trace = actor.trace_id;
    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;
    let charge_tx_id = ledger::insert_transaction(
        &mut tx,
        &NewTransaction {
            wallet_id,
            customer_id: actor.actor_id,
            store_id,
            tx_type: TransactionType::Charge,
            amount,
            ref_transaction_id: None,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?;

    let lot_id = ledger::insert_lot(
        &mut tx,
        &NewLot {
            wallet_id,
            store_id,
            amount,
            expires_at: Utc::now() + Duration::days(state.charge_lot_validity_days),
            source_type: LotSourceType::Charge,
            contributor_wallet_id: None,
            origin_charge_tx_id: Some(charge_tx_id),
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    ledger::insert_lot_move(&mut tx, charge_tx_id, lot_id, amount.raw())
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    ledger::credit_balance(&mut tx, wallet_id, store_id, amount)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;

    let balance: i64 = sqlx::query_scalar(
        "SELECT balance FROM wallet_store_balances WHERE wallet_id = $1 AND store_id = $2",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;
    Ok((charge_tx_id, balance))
}

/// POST /api/wallets/:wallet_id/transfer
pub async fn transfer_points(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path(wallet_id): Path<Uuid>,
    headers: HeaderMap,
    Json(raw_body): Json<Value>,
) -> Result<Response, ApiError> {
    ensure_actor(&actor, ActorType::Customer)?;
    let trace = actor.trace_id;
    let key = idempotency_key_from_headers(&headers)?;
    let req: TransferRequest = serde_json::from_value(raw_body.clone()).map_err(|e| {
        ApiError::BadRequest { code: "invalid_body", trace_id: trace, message: Some(e.to_string()) }
    })?;
    let body_hash = idempotency::canonical_body_hash(&raw_body);
    let method_path = format!("POST /api/wallets/{wallet_id}/transfer");

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let gate = idempotency::gate(&mut conn, &actor, &method_path, key, &body_hash)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    match gate {
        Gate::InFlight => Err(ApiError::InProgress { retry_after_secs: RETRY_AFTER_SECS, trace_id: trace }),
        Gate::BodyConflict => Err(ApiError::conflict("idempotency_body_conflict", trace)),
        Gate::Replay { status, body } => Ok(snapshot_response(status, body)),
        Gate::ReplayByResource { status, resource_public_id } => {
            let out_tx = resource_public_id
                .ok_or_else(|| ApiError::internal("replay record lost its resource id", trace))?;
            let body = load_transfer_result(&mut conn, out_tx)
                .await?
                .ok_or_else(|| ApiError::internal("replayed transfer vanished", trace))?;
            Ok(snapshot_response(status, body))
        }
        Gate::Fresh(record) => match transfer_inner(&state, &actor, wallet_id, &req).await {
            Ok(resp) => {
                let out_tx = resp.out_transaction_id;
                let body = serde_json::to_value(&resp).map_err(|e| ApiError::internal(e, trace))?;
                idempotency::complete(&mut conn, record.id, 200, &body, Some(out_tx))
                    .await
                    .map_err(|e| ApiError::internal(e, trace))?;
                Ok(snapshot_response(200, body))
            }
            Err(api_err) => {
                let _ = idempotency::release(&mut conn, record.id).await;
                Err(api_err)
            }
        },
    }
}

async fn load_transfer_result(
    conn: &mut PgConnection,
    out_transaction_id: Uuid,
) -> Result<Option<Value>, ApiError> {
    let out = sqlx::query_as::<_, ledger::LedgerTransaction>(
        "SELECT id, wallet_id, customer_id, store_id, tx_type, amount, created_at, ref_transaction_id
         FROM transactions WHERE id = $1 AND tx_type = 'TRANSFER_OUT'",
    )
    .bind(out_transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    let Some(out) = out else { return Ok(None) };
    let incoming = sqlx::query_as::<_, ledger::LedgerTransaction>(
        "SELECT id, wallet_id, customer_id, store_id, tx_type, amount, created_at, ref_transaction_id
         FROM transactions WHERE ref_transaction_id = $1 AND tx_type = 'TRANSFER_IN'",
    )
    .bind(out_transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    let Some(incoming) = incoming else { return Ok(None) };
    let resp = TransferResponse {
        out_transaction_id: out.id,
        in_transaction_id: incoming.id,
        source_wallet_id: out.wallet_id,
        target_wallet_id: incoming.wallet_id,
        store_id: out.store_id,
        amount: out.amount,
    };
    serde_json::to_value(&resp)
        .map(Some)
        .map_err(|e| ApiError::internal(e, None))
}

async fn transfer_inner(
    state: &AppState,
    actor: &ActorContext,
    wallet_id: Uuid,
    req: &TransferRequest,
) -> Result<TransferResponse, ApiError> {
    let trace = actor.trace_id;
    let amount = Points::positive(req.amount)
        .map_err(|_| ApiError::bad_request("invalid_amount", trace))?;
    if req.target_wallet_id == wallet_id {
        return Err(ApiError::bad_request("transfer_to_self", trace));
    }

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    load_owned_wallet(&mut conn, wallet_id, actor).await?;
    let target_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM wallets WHERE id = $1")
        .bind(req.target_wallet_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    if target_exists.is_none() {
        return Err(ApiError::NotFound { code: "target_wallet_not_found", trace_id: trace });
    }
    drop(conn);

    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;
    let capture_req = CaptureRequest {
        wallet_id,
        customer_id: actor.actor_id,
        store_id: req.store_id,
        amount,
        tx_type: TransactionType::TransferOut,
        lines: Vec::new(),
    };
    let out_tx_id = match capture::capture(&mut tx, &capture_req, &state.spend_policy).await {
        Ok(CaptureOutcome::Captured { transaction_id }) => transaction_id,
        Ok(CaptureOutcome::InsufficientFunds) => {
            return Err(ApiError::bad_request("insufficient_funds", trace));
        }
        Ok(CaptureOutcome::PolicyViolation { code }) => {
            return Err(ApiError::bad_request(code, trace));
        }
        Err(err) => {
            tracing::error!(error = %err, %wallet_id, "transfer capture failed");
            return Err(ApiError::internal("transfer capture failed", trace));
        }
    };

    let in_tx_id = ledger::insert_transaction(
        &mut tx,
        &NewTransaction {
            wallet_id: req.target_wallet_id,
            customer_id: actor.actor_id,
            store_id: req.store_id,
            tx_type: TransactionType::TransferIn,
            amount,
            ref_transaction_id: Some(out_tx_id),
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    let lot_id = ledger::insert_lot(
        &mut tx,
        &NewLot {
            wallet_id: req.target_wallet_id,
            store_id: req.store_id,
            amount,
            expires_at: Utc::now() + Duration::days(state.charge_lot_validity_days),
            source_type: LotSourceType::TransferIn,
            contributor_wallet_id: Some(wallet_id),
            origin_charge_tx_id: None,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    ledger::insert_lot_move(&mut tx, in_tx_id, lot_id, amount.raw())
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    ledger::credit_balance(&mut tx, req.target_wallet_id, req.store_id, amount)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;

    state.events.publish(WalletEvent::new(
        actor.actor_id,
        "TRANSFER_COMPLETED",
        format!("Transferred {} points to wallet {}", amount, req.target_wallet_id),
    ));

    Ok(TransferResponse {
        out_transaction_id: out_tx_id,
        in_transaction_id: in_tx_id,
        source_wallet_id: wallet_id,
        target_wallet_id: req.target_wallet_id,
        store_id: req.store_id,
        amount: amount.raw(),
    })
}

/// GET /api/wallets/:wallet_id/stores/:store_id/balance
pub async fn get_store_balance(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path((wallet_id, store_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let trace = actor.trace_id;
    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;
    if actor.actor_type == ActorType::Customer {
        load_owned_wallet(&mut tx, wallet_id, &actor).await?;
    }

    // Sweep anything that lapsed since the last touch so the reported
    // balance matches the spendable lots.
    ledger::reconcile_expired_lots(&mut tx, wallet_id, store_id)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;

    let balance: Option<i64> = sqlx::query_scalar(
        "SELECT balance FROM wallet_store_balances WHERE wallet_id = $1 AND store_id = $2",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;

    let lots = sqlx::query_as::<_, WalletStoreLot>(
        "SELECT id, wallet_id, store_id, amount_total, amount_remaining, acquired_at, expires_at,
                source_type, status, contributor_wallet_id, origin_charge_tx_id
         FROM wallet_store_lots
         WHERE wallet_id = $1 AND store_id = $2
           AND status = 'ACTIVE' AND amount_remaining > 0 AND expires_at > NOW()
         ORDER BY acquired_at ASC, id ASC",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;

    Ok(Json(BalanceResponse {
        wallet_id,
        store_id,
        balance: balance.unwrap_or(0),
        lots: lots
            .into_iter()
            .map(|l| LotView {
                id: l.id,
                amount_remaining: l.amount_remaining,
                acquired_at: l.acquired_at,
                expires_at: l.expires_at,
                source_type: l.source_type,
            })
            .collect(),
    }))
}
