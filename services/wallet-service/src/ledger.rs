use chrono::{DateTime, Utc};
use common_money::Points;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use thiserror::Error;
use uuid::Uuid;

/// Append-only ledger entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Charge,
    Use,
    TransferIn,
    TransferOut,
    CancelUse,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Charge => "CHARGE",
            TransactionType::Use => "USE",
            TransactionType::TransferIn => "TRANSFER_IN",
            TransactionType::TransferOut => "TRANSFER_OUT",
            TransactionType::CancelUse => "CANCEL_USE",
        }
    }

    pub fn from_str(s: &str) -> Option<TransactionType> {
        match s {
            "CHARGE" => Some(TransactionType::Charge),
            "USE" => Some(TransactionType::Use),
            "TRANSFER_IN" => Some(TransactionType::TransferIn),
            "TRANSFER_OUT" => Some(TransactionType::TransferOut),
            "CANCEL_USE" => Some(TransactionType::CancelUse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotSourceType {
    Charge,
    TransferIn,
    Canceled,
}

impl LotSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotSourceType::Charge => "CHARGE",
            LotSourceType::TransferIn => "TRANSFER_IN",
            LotSourceType::Canceled => "CANCELED",
        }
    }

    pub fn from_str(s: &str) -> Option<LotSourceType> {
        match s {
            "CHARGE" => Some(LotSourceType::Charge),
            "TRANSFER_IN" => Some(LotSourceType::TransferIn),
            "CANCELED" => Some(LotSourceType::Canceled),
            _ => None,
        }
    }
}

/// Lots are never deleted; a lot leaves circulation by draining to zero,
/// passing its expiry (EXPIRED, set by reconciliation), or an operator
/// void. amount_remaining is preserved on both for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Active,
    Expired,
    Void,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Active => "ACTIVE",
            LotStatus::Expired => "EXPIRED",
            LotStatus::Void => "VOID",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub owner_type: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletStoreBalance {
    pub wallet_id: Uuid,
    pub store_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletStoreLot {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub store_id: Uuid,
    pub amount_total: i64,
    pub amount_remaining: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_type: String,
    pub status: String,
    pub contributor_wallet_id: Option<Uuid>,
    pub origin_charge_tx_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub tx_type: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub ref_transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletLotMove {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub lot_id: Uuid,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLine {
    pub menu_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i32,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The cached balance admitted a spend the lots cannot cover. The two
    /// are mutated in the same transaction, so this is unreachable unless
    /// the invariant `balance == sum(active lot remaining)` is already
    /// broken. Fatal, never a business rejection.
    #[error("lot shortfall for wallet {wallet_id} store {store_id}: covered {covered} of {requested}")]
    LotShortfall {
        wallet_id: Uuid,
        store_id: Uuid,
        requested: i64,
        covered: i64,
    },
    #[error("restore mismatch for transaction {transaction_id}: restored {restored}, expected {expected}")]
    RestoreMismatch {
        transaction_id: Uuid,
        restored: i64,
        expected: i64,
    },
    #[error("balance for wallet {wallet_id} store {store_id} cannot absorb expired residual {residual}")]
    BalanceDrift {
        wallet_id: Uuid,
        store_id: Uuid,
        residual: i64,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Read-only view of a lot eligible for consumption, in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableLot {
    pub id: Uuid,
    pub amount_remaining: i64,
    pub acquired_at: DateTime<Utc>,
}

/// Planned decrement against one lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotDraw {
    pub lot_id: Uuid,
    pub amount: i64,
}

/// Walk lots oldest-first and decide how much each contributes. Pure: the
/// conditional UPDATEs that apply the plan re-check every amount, so a stale
/// read here degrades into a row-affected miss, not an overdraw.
pub fn plan_lot_draws(lots: &[SpendableLot], amount: Points) -> Result<Vec<LotDraw>, i64> {
    let mut remaining = amount.raw();
    let mut draws = Vec::new();
    for lot in lots {
        if remaining == 0 {
            break;
        }
        if lot.amount_remaining <= 0 {
            continue;
        }
        let take = lot.amount_remaining.min(remaining);
        draws.push(LotDraw {
            lot_id: lot.id,
            amount: take,
        });
        remaining -= take;
    }
    if remaining > 0 {
        // Covered amount goes back to the caller for the fatal report.
        return Err(amount.raw() - remaining);
    }
    Ok(draws)
}

/// Sum of restore deltas must land exactly on the original amount.
pub fn verify_restore_total(restored: i64, original_amount: i64) -> bool {
    restored == original_amount
}

/// Conditional single-row decrement; `false` means insufficient funds. The
/// WHERE guard makes read-then-write races impossible without a lock.
pub async fn try_debit_balance(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    store_id: Uuid,
    amount: Points,
) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        "UPDATE wallet_store_balances
         SET balance = balance - $1, updated_at = NOW()
         WHERE wallet_id = $2 AND store_id = $3 AND balance >= $1",
    )
    .bind(amount.raw())
    .bind(wallet_id)
    .bind(store_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Upsert credit; creates the (wallet, store) row on first acquisition.
pub async fn credit_balance(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    store_id: Uuid,
    amount: Points,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO wallet_store_balances (wallet_id, store_id, balance, updated_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (wallet_id, store_id) DO UPDATE
         SET balance = wallet_store_balances.balance + EXCLUDED.balance, updated_at = NOW()",
    )
    .bind(wallet_id)
    .bind(store_id)
    .bind(amount.raw())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Spendable lots for (wallet, store), FIFO with a stable tie-break on id.
pub async fn spendable_lots(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    store_id: Uuid,
) -> Result<Vec<SpendableLot>, LedgerError> {
    let rows = sqlx::query_as::<_, WalletStoreLot>(
        "SELECT id, wallet_id, store_id, amount_total, amount_remaining, acquired_at, expires_at,
                source_type, status, contributor_wallet_id, origin_charge_tx_id
         FROM wallet_store_lots
         WHERE wallet_id = $1 AND store_id = $2
           AND status = 'ACTIVE' AND amount_remaining > 0 AND expires_at > NOW()
         ORDER BY acquired_at ASC, id ASC",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|lot| SpendableLot {
            id: lot.id,
            amount_remaining: lot.amount_remaining,
            acquired_at: lot.acquired_at,
        })
        .collect())
}

/// Conditional per-lot decrement; `false` means another writer got there
/// first and the caller should replan.
pub async fn try_drain_lot(
    conn: &mut PgConnection,
    lot_id: Uuid,
    amount: i64,
) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        "UPDATE wallet_store_lots
         SET amount_remaining = amount_remaining - $1
         WHERE id = $2 AND amount_remaining >= $1 AND status = 'ACTIVE'",
    )
    .bind(amount)
    .bind(lot_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Add a refund delta back onto a lot, bounded by amount_total. `false`
/// means the lot cannot absorb it (already gone or bound exceeded).
pub async fn try_restore_lot(
    conn: &mut PgConnection,
    lot_id: Uuid,
    delta: i64,
) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        "UPDATE wallet_store_lots
         SET amount_remaining = amount_remaining + $1
         WHERE id = $2 AND status = 'ACTIVE' AND expires_at > NOW()
           AND amount_remaining + $1 <= amount_total",
    )
    .bind(delta)
    .bind(lot_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub struct NewLot {
    pub wallet_id: Uuid,
    pub store_id: Uuid,
    pub amount: Points,
    pub expires_at: DateTime<Utc>,
    pub source_type: LotSourceType,
    pub contributor_wallet_id: Option<Uuid>,
    pub origin_charge_tx_id: Option<Uuid>,
}

pub async fn insert_lot(conn: &mut PgConnection, lot: &NewLot) -> Result<Uuid, LedgerError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO wallet_store_lots
           (id, wallet_id, store_id, amount_total, amount_remaining, acquired_at, expires_at,
            source_type, status, contributor_wallet_id, origin_charge_tx_id)
         VALUES ($1, $2, $3, $4, $4, NOW(), $5, $6, 'ACTIVE', $7, $8)",
    )
    .bind(id)
    .bind(lot.wallet_id)
    .bind(lot.store_id)
    .bind(lot.amount.raw())
    .bind(lot.expires_at)
    .bind(lot.source_type.as_str())
    .bind(lot.contributor_wallet_id)
    .bind(lot.origin_charge_tx_id)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub struct NewTransaction {
    pub wallet_id: Uuid,
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub tx_type: TransactionType,
    pub amount: Points,
    pub ref_transaction_id: Option<Uuid>,
}

pub async fn insert_transaction(
    conn: &mut PgConnection,
    tx: &NewTransaction,
) -> Result<Uuid, LedgerError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO transactions
           (id, wallet_id, customer_id, store_id, tx_type, amount, created_at, ref_transaction_id)
         VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7)",
    )
    .bind(id)
    .bind(tx.wallet_id)
    .bind(tx.customer_id)
    .bind(tx.store_id)
    .bind(tx.tx_type.as_str())
    .bind(tx.amount.raw())
    .bind(tx.ref_transaction_id)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_lot_move(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    lot_id: Uuid,
    delta: i64,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO wallet_lot_moves (id, transaction_id, lot_id, delta) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(transaction_id)
    .bind(lot_id)
    .bind(delta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_transaction_items(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    lines: &[OrderLine],
) -> Result<(), LedgerError> {
    for line in lines {
        sqlx::query(
            "INSERT INTO transaction_items (id, transaction_id, menu_id, name, unit_price, quantity)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(transaction_id)
        .bind(line.menu_id)
        .bind(&line.name)
        .bind(line.unit_price)
        .bind(line.quantity)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Move lots past their expiry out of circulation and take their residual
/// value off the cached balance, in one transaction with the caller. Keeps
/// the invariant `balance == sum(ACTIVE lot remaining)` true across expiry,
/// which is what lets the capture engine treat a lot shortfall as fatal.
pub async fn reconcile_expired_lots(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    store_id: Uuid,
) -> Result<u64, LedgerError> {
    let rows = sqlx::query_as::<_, (Uuid, i64)>(
        "UPDATE wallet_store_lots SET status = 'EXPIRED'
         WHERE wallet_id = $1 AND store_id = $2 AND status = 'ACTIVE'
           AND expires_at <= NOW() AND amount_remaining > 0
         RETURNING id, amount_remaining",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_all(&mut *conn)
    .await?;

    for (lot_id, residual) in &rows {
        let result = sqlx::query(
            "UPDATE wallet_store_balances
             SET balance = balance - $1, updated_at = NOW()
             WHERE wallet_id = $2 AND store_id = $3 AND balance >= $1",
        )
        .bind(residual)
        .bind(wallet_id)
        .bind(store_id)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() != 1 {
            tracing::error!(
                wallet_id = %wallet_id,
                store_id = %store_id,
                lot_id = %lot_id,
                residual,
                "balance could not absorb expired lot residual"
            );
            return Err(LedgerError::BalanceDrift {
                wallet_id,
                store_id,
                residual: *residual,
            });
        }
    }
    Ok(rows.len() as u64)
}

pub async fn lot_moves_for_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Vec<WalletLotMove>, LedgerError> {
    let rows = sqlx::query_as::<_, WalletLotMove>(
        "SELECT id, transaction_id, lot_id, delta FROM wallet_lot_moves WHERE transaction_id = $1
         ORDER BY id ASC",
    )
    .bind(transaction_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
