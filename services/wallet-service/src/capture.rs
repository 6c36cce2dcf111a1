use common_money::Points;
use sqlx::{Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

use crate::ledger::{
    self, LedgerError, LotDraw, NewTransaction, OrderLine, TransactionType,
};

/// Lot-drain retries tolerated before the engine concludes the cached
/// balance and the lot totals disagree.
const MAX_DRAIN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub wallet_id: Uuid,
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub amount: Points,
    pub tx_type: TransactionType,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Captured { transaction_id: Uuid },
    InsufficientFunds,
    PolicyViolation { code: &'static str },
}

/// Spend policy evaluated before any mutation. Unset cap means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpendPolicy {
    pub daily_cap: Option<i64>,
}

pub fn exceeds_daily_cap(policy: &SpendPolicy, spent_today: i64, amount: Points) -> bool {
    match policy.daily_cap {
        Some(cap) => spent_today + amount.raw() > cap,
        None => false,
    }
}

/// Atomically move `amount` from the wallet's (store) balance and lots into
/// a spend transaction. Takes the caller's open transaction: the engine is
/// never usable outside an enclosing transaction boundary, and every write
/// here commits or rolls back together with the caller's state transition.
pub async fn capture(
    tx: &mut Transaction<'_, Postgres>,
    req: &CaptureRequest,
    policy: &SpendPolicy,
) -> Result<CaptureOutcome, LedgerError> {
    debug_assert!(matches!(
        req.tx_type,
        TransactionType::Use | TransactionType::TransferOut
    ));

    // Expiry is lazy: sweep anything that lapsed since the last touch so the
    // balance guard below only ever admits spends the lots can cover.
    ledger::reconcile_expired_lots(&mut *tx, req.wallet_id, req.store_id).await?;

    if policy.daily_cap.is_some() {
        let spent_today: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions
             WHERE wallet_id = $1 AND tx_type IN ('USE', 'TRANSFER_OUT')
               AND created_at >= date_trunc('day', NOW())",
        )
        .bind(req.wallet_id)
        .fetch_one(&mut **tx)
        .await?;
        if exceeds_daily_cap(policy, spent_today, req.amount) {
            return Ok(CaptureOutcome::PolicyViolation { code: "daily_cap_exceeded" });
        }
    }

    // Step 1: conditional single-row decrement. Zero rows affected is the
    // insufficient-funds signal; no read-then-write window exists.
    if !ledger::try_debit_balance(&mut *tx, req.wallet_id, req.store_id, req.amount).await? {
        return Ok(CaptureOutcome::InsufficientFunds);
    }

    // Step 2: drain spendable lots oldest-first. Each decrement is its own
    // conditional UPDATE; a miss means a concurrent writer moved the lot and
    // we replan from a fresh read. The balance decrement above already
    // reserved the funds, so lots running dry is not contention - it means
    // the cached balance and the lot totals disagree.
    let draws = drain_lots_fifo(tx, req).await?;

    // Step 3: ledger records, same transaction as the mutations above.
    let transaction_id = ledger::insert_transaction(
        &mut *tx,
        &NewTransaction {
            wallet_id: req.wallet_id,
            customer_id: req.customer_id,
            store_id: req.store_id,
            tx_type: req.tx_type,
            amount: req.amount,
            ref_transaction_id: None,
        },
    )
    .await?;
    for draw in &draws {
        ledger::insert_lot_move(&mut *tx, transaction_id, draw.lot_id, -draw.amount).await?;
    }
    if !req.lines.is_empty() {
        ledger::insert_transaction_items(&mut *tx, transaction_id, &req.lines).await?;
    }

    Ok(CaptureOutcome::Captured { transaction_id })
}

async fn drain_lots_fifo(
    tx: &mut Transaction<'_, Postgres>,
    req: &CaptureRequest,
) -> Result<Vec<LotDraw>, LedgerError> {
    let mut consumed: Vec<LotDraw> = Vec::new();
    let mut remaining = req.amount.raw();
    let mut attempts = 0u32;

    while remaining > 0 {
        // Our own earlier decrements are visible inside the transaction, so
        // the read already reflects partially drained lots and drops fully
        // drained ones.
        let lots = ledger::spendable_lots(&mut *tx, req.wallet_id, req.store_id).await?;

        let plan = match ledger::plan_lot_draws(&lots, Points::from_raw(remaining)) {
            Ok(plan) => plan,
            Err(coverable) => {
                let covered: i64 = consumed.iter().map(|d| d.amount).sum();
                error!(
                    wallet_id = %req.wallet_id,
                    store_id = %req.store_id,
                    requested = req.amount.raw(),
                    covered = covered + coverable,
                    "lot totals disagree with cached balance"
                );
                return Err(LedgerError::LotShortfall {
                    wallet_id: req.wallet_id,
                    store_id: req.store_id,
                    requested: req.amount.raw(),
                    covered: covered + coverable,
                });
            }
        };

        let mut missed = false;
        for draw in plan {
            if ledger::try_drain_lot(&mut *tx, draw.lot_id, draw.amount).await? {
                remaining -= draw.amount;
                consumed.push(draw);
            } else {
                // Raced by a concurrent drain; replan from a fresh read.
                missed = true;
                break;
            }
        }
        if missed {
            attempts += 1;
            if attempts > MAX_DRAIN_ATTEMPTS {
                let covered: i64 = consumed.iter().map(|d| d.amount).sum();
                return Err(LedgerError::LotShortfall {
                    wallet_id: req.wallet_id,
                    store_id: req.store_id,
                    requested: req.amount.raw(),
                    covered,
                });
            }
        }
    }

    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_cap() {
        let unlimited = SpendPolicy::default();
        assert!(!exceeds_daily_cap(&unlimited, i64::MAX / 2, Points::from_raw(1)));

        let capped = SpendPolicy { daily_cap: Some(10_000) };
        assert!(!exceeds_daily_cap(&capped, 9_000, Points::from_raw(1_000)));
        assert!(exceeds_daily_cap(&capped, 9_000, Points::from_raw(1_001)));
    }
}
