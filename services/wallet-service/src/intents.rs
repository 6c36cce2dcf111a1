use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

/// Customer approval window for a pending intent.
pub const INTENT_TTL_SECS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Pending,
    Approved,
    Declined,
    Canceled,
    Completed,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "PENDING",
            IntentStatus::Approved => "APPROVED",
            IntentStatus::Declined => "DECLINED",
            IntentStatus::Canceled => "CANCELED",
            IntentStatus::Completed => "COMPLETED",
            IntentStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<IntentStatus> {
        match s {
            "PENDING" => Some(IntentStatus::Pending),
            "APPROVED" => Some(IntentStatus::Approved),
            "DECLINED" => Some(IntentStatus::Declined),
            "CANCELED" => Some(IntentStatus::Canceled),
            "COMPLETED" => Some(IntentStatus::Completed),
            "EXPIRED" => Some(IntentStatus::Expired),
            _ => None,
        }
    }
}

/// Valid transitions:
/// PENDING -> APPROVED | DECLINED | CANCELED | EXPIRED
/// APPROVED -> COMPLETED
/// Everything else is terminal.
pub fn is_valid_transition(from_status: &str, to: IntentStatus) -> bool {
    match IntentStatus::from_str(from_status) {
        Some(IntentStatus::Pending) => matches!(
            to,
            IntentStatus::Approved
                | IntentStatus::Declined
                | IntentStatus::Canceled
                | IntentStatus::Expired
        ),
        Some(IntentStatus::Approved) => matches!(to, IntentStatus::Completed),
        Some(
            IntentStatus::Declined
            | IntentStatus::Canceled
            | IntentStatus::Completed
            | IntentStatus::Expired,
        ) => false,
        None => false,
    }
}

/// Expiry is enforced lazily on every read; a stored PENDING past its
/// expires_at is already dead.
pub fn is_past_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expires_at
}

pub fn expiry_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::seconds(INTENT_TTL_SECS)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub public_id: Uuid,
    pub qr_token_id: Uuid,
    pub customer_id: Uuid,
    pub store_id: Uuid,
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
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentIntentItem {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub menu_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i32,
}

const INTENT_COLUMNS: &str = "id, public_id, qr_token_id, customer_id, store_id, wallet_id, amount,
status, created_at, expires_at, approved_at, completed_at, declined_at, canceled_at,
use_transaction_id, version";

pub async fn get_by_public_id(
    conn: &mut PgConnection,
    public_id: Uuid,
) -> Result<Option<PaymentIntent>, sqlx::Error> {
    sqlx::query_as::<_, PaymentIntent>(&format!(
        "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE public_id = $1"
    ))
    .bind(public_id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn items_for_intent(
    conn: &mut PgConnection,
    intent_id: Uuid,
) -> Result<Vec<PaymentIntentItem>, sqlx::Error> {
    sqlx::query_as::<_, PaymentIntentItem>(
        "SELECT id, intent_id, menu_id, name, unit_price, quantity
         FROM payment_intent_items WHERE intent_id = $1 ORDER BY id ASC",
    )
    .bind(intent_id)
    .fetch_all(&mut *conn)
    .await
}

/// Version-checked conditional transition. Zero rows affected means another
/// writer won the race (or the stored status moved on); the caller surfaces
/// a retryable conflict, never a silent overwrite.
pub async fn try_transition(
    conn: &mut PgConnection,
    intent_id: Uuid,
    from: IntentStatus,
    to: IntentStatus,
    version: i32,
) -> Result<bool, sqlx::Error> {
    if !is_valid_transition(from.as_str(), to) {
        return Ok(false);
    }
    let stamp_column = match to {
        IntentStatus::Approved => "approved_at",
        IntentStatus::Completed => "completed_at",
        IntentStatus::Declined => "declined_at",
        IntentStatus::Canceled | IntentStatus::Expired => "canceled_at",
        IntentStatus::Pending => return Ok(false),
    };
    let result = sqlx::query(&format!(
        "UPDATE payment_intents
         SET status = $1, version = version + 1, {stamp_column} = NOW()
         WHERE id = $2 AND status = $3 AND version = $4"
    ))
    .bind(to.as_str())
    .bind(intent_id)
    .bind(from.as_str())
    .bind(version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// APPROVED -> COMPLETED with the capture's transaction id as the
/// settlement link.
pub async fn complete_with_transaction(
    conn: &mut PgConnection,
    intent_id: Uuid,
    version: i32,
    use_transaction_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_intents
         SET status = 'COMPLETED', version = version + 1, completed_at = NOW(),
             use_transaction_id = $3
         WHERE id = $1 AND status = 'APPROVED' AND version = $2",
    )
    .bind(intent_id)
    .bind(version)
    .bind(use_transaction_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Hygiene sweep; correctness never depends on it because expiry is also
/// checked on every read.
pub async fn expire_stale_intents(conn: &mut PgConnection) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_intents
         SET status = 'EXPIRED', version = version + 1, canceled_at = NOW()
         WHERE status = 'PENDING' AND expires_at < NOW()",
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pending_is_the_only_open_state() {
        assert!(is_valid_transition("PENDING", IntentStatus::Approved));
        assert!(is_valid_transition("PENDING", IntentStatus::Declined));
        assert!(is_valid_transition("PENDING", IntentStatus::Canceled));
        assert!(is_valid_transition("PENDING", IntentStatus::Expired));
        assert!(is_valid_transition("APPROVED", IntentStatus::Completed));

        for terminal in ["DECLINED", "CANCELED", "COMPLETED", "EXPIRED"] {
            for to in [
                IntentStatus::Approved,
                IntentStatus::Declined,
                IntentStatus::Completed,
                IntentStatus::Expired,
            ] {
                assert!(!is_valid_transition(terminal, to), "{terminal} -> {to:?}");
            }
        }
        assert!(!is_valid_transition("APPROVED", IntentStatus::Declined));
        assert!(!is_valid_transition("garbage", IntentStatus::Approved));
    }

    #[test]
    fn test_lazy_expiry_boundary() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let expires = expiry_for(created);
        assert_eq!((expires - created).num_seconds(), INTENT_TTL_SECS);
        assert!(!is_past_expiry(expires, expires - Duration::seconds(1)));
        // the boundary instant itself is already expired
        assert!(is_past_expiry(expires, expires));
        assert!(is_past_expiry(expires, expires + Duration::seconds(1)));
    }
}
