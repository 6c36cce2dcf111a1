use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateway::{external_reference, BankGateway};

/// Billing cutover period.
pub const BILLING_WEEK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Locked,
    Completed,
    Canceled,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Locked => "LOCKED",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Canceled => "CANCELED",
            SettlementStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<SettlementStatus> {
        match s {
            "PENDING" => Some(SettlementStatus::Pending),
            "LOCKED" => Some(SettlementStatus::Locked),
            "COMPLETED" => Some(SettlementStatus::Completed),
            "CANCELED" => Some(SettlementStatus::Canceled),
            "FAILED" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementTask {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub store_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// One task per completed capture; idempotent on the transaction id.
pub async fn enqueue_task(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    store_id: Uuid,
    amount: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO settlement_tasks (id, transaction_id, store_id, amount, status, created_at)
         VALUES ($1, $2, $3, $4, 'PENDING', NOW())
         ON CONFLICT (transaction_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(transaction_id)
    .bind(store_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Task status for a transaction, if a task exists. Refund eligibility is
/// gated on this: LOCKED and later means billing already cut over.
pub async fn task_status_for_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT status FROM settlement_tasks WHERE transaction_id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
}

/// PENDING -> CANCELED when the underlying transaction is refunded before
/// the weekly cutover.
pub async fn cancel_task_for_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE settlement_tasks SET status = 'CANCELED'
         WHERE transaction_id = $1 AND status = 'PENDING'",
    )
    .bind(transaction_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Latest cutover boundary that is due, stepping in whole billing weeks from
/// the persisted boundary. None while the current week is still open. A
/// missed run catches up on every elapsed week instead of skipping it.
pub fn advance_cutover(last_cutover: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let week = Duration::days(BILLING_WEEK_DAYS);
    let mut boundary = last_cutover;
    while now >= boundary + week {
        boundary = boundary + week;
    }
    if boundary > last_cutover {
        Some(boundary)
    } else {
        None
    }
}

pub fn group_tasks_by_store(tasks: &[SettlementTask]) -> BTreeMap<Uuid, Vec<&SettlementTask>> {
    let mut groups: BTreeMap<Uuid, Vec<&SettlementTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.store_id).or_default().push(task);
    }
    groups
}

/// Creates the cutover marker on first boot, anchored to the start of the
/// current week so the first run does not settle a partial window.
pub async fn ensure_cutover_row(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO settlement_cutover (singleton, last_cutover_at)
         VALUES (TRUE, date_trunc('week', NOW()))
         ON CONFLICT (singleton) DO NOTHING",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Phase 1: advance the persisted cutover boundary and lock everything
/// settleable that was created before it. FAILED tasks from the previous
/// run are re-locked first so an external outage is retried weekly.
pub async fn lock_due_tasks(pool: &PgPool) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;

    // The FOR UPDATE on the singleton serializes concurrent schedulers; the
    // boundary comes from storage, never recomputed from wall clock alone.
    let last_cutover: DateTime<Utc> = sqlx::query_scalar(
        "SELECT last_cutover_at FROM settlement_cutover WHERE singleton = TRUE FOR UPDATE",
    )
    .fetch_one(&mut *tx)
    .await?;

    let Some(new_boundary) = advance_cutover(last_cutover, Utc::now()) else {
        return Ok(0);
    };

    let relocked = sqlx::query(
        "UPDATE settlement_tasks SET status = 'LOCKED', locked_at = NOW(), failure_reason = NULL
         WHERE status = 'FAILED'",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let locked = sqlx::query(
        "UPDATE settlement_tasks SET status = 'LOCKED', locked_at = NOW()
         WHERE status = 'PENDING' AND created_at < $1",
    )
    .bind(new_boundary)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query("UPDATE settlement_cutover SET last_cutover_at = $1 WHERE singleton = TRUE")
        .bind(new_boundary)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!(locked, relocked, boundary = %new_boundary, "settlement phase 1 cutover");
    Ok(locked + relocked)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DisburseReport {
    pub completed_groups: u32,
    pub failed_groups: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

/// Phase 2: one aggregate deposit per store. Failure is per store group;
/// one store's bank error never blocks the others. A crash mid-phase leaves
/// tasks LOCKED and the next run picks them up again.
pub async fn disburse_locked(
    pool: &PgPool,
    bank: &dyn BankGateway,
) -> anyhow::Result<DisburseReport> {
    let tasks = sqlx::query_as::<_, SettlementTask>(
        "SELECT id, transaction_id, store_id, amount, status, created_at, locked_at, completed_at,
                failure_reason
         FROM settlement_tasks WHERE status = 'LOCKED'
         ORDER BY store_id, created_at",
    )
    .fetch_all(pool)
    .await?;

    let mut report = DisburseReport::default();
    for (store_id, group) in group_tasks_by_store(&tasks) {
        let ids: Vec<Uuid> = group.iter().map(|t| t.id).collect();
        match disburse_store_group(pool, bank, store_id, &ids).await {
            Ok(count) => {
                report.completed_groups += 1;
                report.completed_tasks += count;
            }
            Err(err) => {
                warn!(error = %err, store_id = %store_id, "settlement group failed");
                report.failed_groups += 1;
                report.failed_tasks += ids.len() as u64;
                if let Err(mark_err) = mark_group_failed(pool, &ids, &err.to_string()).await {
                    error!(error = %mark_err, store_id = %store_id, "failed to mark settlement group FAILED");
                }
            }
        }
    }
    info!(
        completed_groups = report.completed_groups,
        failed_groups = report.failed_groups,
        "settlement phase 2 finished"
    );
    Ok(report)
}

async fn disburse_store_group(
    pool: &PgPool,
    bank: &dyn BankGateway,
    store_id: Uuid,
    task_ids: &[Uuid],
) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;

    // Re-read under lock: a concurrent run may already own (or have
    // completed) part of this group.
    let amounts: Vec<i64> = sqlx::query_scalar(
        "SELECT amount FROM settlement_tasks
         WHERE id = ANY($1) AND status = 'LOCKED' FOR UPDATE",
    )
    .bind(task_ids)
    .fetch_all(&mut *tx)
    .await?;
    if amounts.is_empty() {
        return Ok(0);
    }
    let total: i64 = amounts.iter().sum();

    let reference = external_reference();
    let approval = bank
        .request_account_deposit(store_id, &reference, total)
        .await?;
    if !approval.success {
        anyhow::bail!("bank rejected deposit for store {store_id} (reference {reference})");
    }

    let updated = sqlx::query(
        "UPDATE settlement_tasks SET status = 'COMPLETED', completed_at = NOW()
         WHERE id = ANY($1) AND status = 'LOCKED'",
    )
    .bind(task_ids)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    Ok(updated)
}

async fn mark_group_failed(
    pool: &PgPool,
    task_ids: &[Uuid],
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE settlement_tasks SET status = 'FAILED', failure_reason = $2
         WHERE id = ANY($1) AND status = 'LOCKED'",
    )
    .bind(task_ids)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Time-driven loop; both phases stay directly callable for tests.
pub fn spawn_settlement_scheduler(
    pool: PgPool,
    bank: Arc<dyn BankGateway>,
    check_interval: StdDuration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(check_interval).await;
            let start = std::time::Instant::now();
            if let Err(err) = lock_due_tasks(&pool).await {
                error!(?err, "settlement phase 1 error");
            }
            crate::app::SETTLEMENT_RUN_SECONDS
                .with_label_values(&["lock"])
                .observe(start.elapsed().as_secs_f64());
            let start = std::time::Instant::now();
            if let Err(err) = disburse_locked(&pool, bank.as_ref()).await {
                error!(?err, "settlement phase 2 error");
            }
            crate::app::SETTLEMENT_RUN_SECONDS
                .with_label_values(&["disburse"])
                .observe(start.elapsed().as_secs_f64());
        }
    });
}
