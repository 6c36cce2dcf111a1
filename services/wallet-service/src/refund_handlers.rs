use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use common_http_errors::ApiError;
use common_security::{ensure_actor, ActorContext, ActorCtxExtractor, ActorType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::app::{idempotency_key_from_headers, snapshot_response, AppState, REFUNDS_TOTAL};
use crate::events::WalletEvent;
use crate::idempotency::{self, Gate, RETRY_AFTER_SECS};
use crate::ledger::{
    self, LedgerTransaction, LotSourceType, NewLot, NewTransaction, TransactionType,
    WalletStoreLot,
};
use crate::settlement;

#[derive(Debug, Serialize, Deserialize)]
pub struct RefundResponse {
    pub refund_transaction_id: Uuid,
    pub original_transaction_id: Uuid,
    pub store_id: Uuid,
    pub wallet_id: Uuid,
    pub amount: i64,
    pub refunded_at: DateTime<Utc>,
}

const TX_COLUMNS: &str =
    "id, wallet_id, customer_id, store_id, tx_type, amount, created_at, ref_transaction_id";

/// POST /api/stores/:store_id/transactions/:tx_id/refund
///
/// Full cancellation of a completed spend. Serialized per original
/// transaction by a pessimistic row lock; an already-canceled transaction is
/// a friendly replay of the prior result, never an error.
pub async fn refund_transaction(
    State(state): State<AppState>,
    ActorCtxExtractor(actor): ActorCtxExtractor,
    Path((store_id, tx_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    ensure_actor(&actor, ActorType::Merchant)?;
    let trace = actor.trace_id;
    if actor.actor_id != store_id {
        return Err(ApiError::Forbidden { trace_id: trace });
    }
    let key = idempotency_key_from_headers(&headers)?;
    let raw_body = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let body_hash = idempotency::canonical_body_hash(&raw_body);
    let method_path = format!("POST /api/stores/{store_id}/transactions/{tx_id}/refund");

    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, trace))?;
    let gate = idempotency::gate(&mut conn, &actor, &method_path, key, &body_hash)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    match gate {
        Gate::InFlight => Err(ApiError::InProgress { retry_after_secs: RETRY_AFTER_SECS, trace_id: trace }),
        Gate::BodyConflict => Err(ApiError::conflict("idempotency_body_conflict", trace)),
        Gate::Replay { status, body } => Ok(snapshot_response(status, body)),
        Gate::ReplayByResource { status, .. } => {
            // the refund resource is re-derivable from the original id
            let result = load_prior_refund(&state, tx_id).await?;
            let result = result
                .ok_or_else(|| ApiError::internal("replayed refund vanished", trace))?;
            let body = serde_json::to_value(&result).map_err(|e| ApiError::internal(e, trace))?;
            Ok(snapshot_response(status, body))
        }
        Gate::Fresh(record) => match refund_inner(&state, &actor, store_id, tx_id).await {
            Ok(result) => {
                match serde_json::to_value(&result) {
                    Ok(body) => {
                        idempotency::complete(&mut conn, record.id, 200, &body, Some(result.refund_transaction_id))
                            .await
                            .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(200, body))
                    }
                    Err(err) => {
                        warn!(error = %err, %tx_id, "refund snapshot serialization failed");
                        idempotency::complete_without_snapshot(
                            &mut conn,
                            record.id,
                            200,
                            Some(result.refund_transaction_id),
                        )
                        .await
                        .map_err(|e| ApiError::internal(e, trace))?;
                        Ok(snapshot_response(200, serde_json::to_value(&result).unwrap_or_default()))
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

async fn load_prior_refund(
    state: &AppState,
    original_tx_id: Uuid,
) -> Result<Option<RefundResponse>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(|e| ApiError::internal(e, None))?;
    let prior = sqlx::query_as::<_, LedgerTransaction>(&format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE ref_transaction_id = $1 AND tx_type = 'CANCEL_USE'"
    ))
    .bind(original_tx_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    Ok(prior.map(|p| RefundResponse {
        refund_transaction_id: p.id,
        original_transaction_id: original_tx_id,
        store_id: p.store_id,
        wallet_id: p.wallet_id,
        amount: p.amount,
        refunded_at: p.created_at,
    }))
}

async fn refund_inner(
    state: &AppState,
    actor: &ActorContext,
    store_id: Uuid,
    tx_id: Uuid,
) -> Result<RefundResponse, ApiError> {
    let trace = actor.trace_id;
    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, trace))?;

    // Pessimistic lock on the original serializes concurrent cancels.
    let original = sqlx::query_as::<_, LedgerTransaction>(&format!(
        "SELECT {TX_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE"
    ))
    .bind(tx_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?
    .ok_or(ApiError::NotFound { code: "transaction_not_found", trace_id: trace })?;

    if original.store_id != store_id {
        return Err(ApiError::bad_request("transaction_store_mismatch", trace));
    }
    if TransactionType::from_str(&original.tx_type) != Some(TransactionType::Use) {
        // only spend events are refundable
        return Err(ApiError::bad_request("not_refundable", trace));
    }

    // Already canceled: friendly replay of the prior result.
    let prior = sqlx::query_as::<_, LedgerTransaction>(&format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE ref_transaction_id = $1 AND tx_type = 'CANCEL_USE'"
    ))
    .bind(tx_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, trace))?;
    if let Some(prior) = prior {
        return Ok(RefundResponse {
            refund_transaction_id: prior.id,
            original_transaction_id: tx_id,
            store_id,
            wallet_id: prior.wallet_id,
            amount: prior.amount,
            refunded_at: prior.created_at,
        });
    }

    // Billing gate: once the weekly cutover locked the task, the money is on
    // its way to the merchant and the refund window is closed.
    match settlement::task_status_for_transaction(&mut tx, tx_id)
        .await
        .map_err(|e| ApiError::internal(e, trace))?
        .as_deref()
    {
        None | Some("PENDING") => {
            settlement::cancel_task_for_transaction(&mut tx, tx_id)
                .await
                .map_err(|e| ApiError::internal(e, trace))?;
        }
        Some(_) => {
            return Err(ApiError::bad_request("settlement_cutover", trace));
        }
    }

    let refund_tx_id = ledger::insert_transaction(
        &mut tx,
        &NewTransaction {
            wallet_id: original.wallet_id,
            customer_id: original.customer_id,
            store_id,
            tx_type: TransactionType::CancelUse,
            amount: common_money::Points::from_raw(original.amount),
            ref_transaction_id: Some(original.id),
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, trace))?;

    restore_balance(&mut tx, original.wallet_id, store_id, original.amount)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;

    // Re-derive exactly which lots the original consumed and hand each its
    // delta back.
    let moves = ledger::lot_moves_for_transaction(&mut tx, original.id)
        .await
        .map_err(|e| ApiError::internal(e, trace))?;
    let mut restored: i64 = 0;
    for lot_move in moves.iter().filter(|m| m.delta < 0) {
        let back = -lot_move.delta;
        let landed = ledger::try_restore_lot(&mut tx, lot_move.lot_id, back)
            .await
            .map_err(|e| ApiError::internal(e, trace))?;
        let restored_lot_id = if landed {
            lot_move.lot_id
        } else {
            // The original lot expired or was voided in the meantime; the
            // value comes back as a fresh lot instead of resurrecting it.
            let dead = sqlx::query_as::<_, WalletStoreLot>(
                "SELECT id, wallet_id, store_id, amount_total, amount_remaining, acquired_at,
                        expires_at, source_type, status, contributor_wallet_id, origin_charge_tx_id
                 FROM wallet_store_lots WHERE id = $1",
            )
            .bind(lot_move.lot_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ApiError::internal(e, trace))?;
            ledger::insert_lot(
                &mut tx,
                &NewLot {
                    wallet_id: original.wallet_id,
                    store_id,
                    amount: common_money::Points::from_raw(back),
                    expires_at: Utc::now() + Duration::days(state.charge_lot_validity_days),
                    source_type: LotSourceType::Canceled,
                    contributor_wallet_id: dead.contributor_wallet_id,
                    origin_charge_tx_id: dead.origin_charge_tx_id,
                },
            )
            .await
            .map_err(|e| ApiError::internal(e, trace))?
        };
        ledger::insert_lot_move(&mut tx, refund_tx_id, restored_lot_id, back)
            .await
            .map_err(|e| ApiError::internal(e, trace))?;
        restored += back;
    }

    if !ledger::verify_restore_total(restored, original.amount) {
        let err = ledger::LedgerError::RestoreMismatch {
            transaction_id: original.id,
            restored,
            expected: original.amount,
        };
        error!(error = %err, "refund invariant violation");
        return Err(ApiError::internal("refund restore sum mismatch", trace));
    }

    tx.commit().await.map_err(|e| ApiError::internal(e, trace))?;
    REFUNDS_TOTAL.with_label_values(&["completed"]).inc();

    // best-effort; a notification failure never unwinds the refund
    state.events.publish(WalletEvent::new(
        original.customer_id,
        "REFUND_COMPLETED",
        format!("{} points refunded by store {}", original.amount, store_id),
    ));

    Ok(RefundResponse {
        refund_transaction_id: refund_tx_id,
        original_transaction_id: original.id,
        store_id,
        wallet_id: original.wallet_id,
        amount: original.amount,
        refunded_at: Utc::now(),
    })
}

/// Lock-or-create then credit. The upsert keeps the add-back atomic even
/// when the balance row was never created for this (wallet, store).
async fn restore_balance(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    wallet_id: Uuid,
    store_id: Uuid,
    amount: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT balance FROM wallet_store_balances WHERE wallet_id = $1 AND store_id = $2 FOR UPDATE")
        .bind(wallet_id)
        .bind(store_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO wallet_store_balances (wallet_id, store_id, balance, updated_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (wallet_id, store_id) DO UPDATE
         SET balance = wallet_store_balances.balance + EXCLUDED.balance, updated_at = NOW()",
    )
    .bind(wallet_id)
    .bind(store_id)
    .bind(amount)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
