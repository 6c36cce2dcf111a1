//! End-to-end ledger flows against a real PostgreSQL. Ignored by default;
//! set DATABASE_URL and run with `cargo test -- --ignored`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use serde_json::{json, Value};
use sqlx::{Executor, PgPool};
use tower::ServiceExt;
use uuid::Uuid;

use wallet_service::app::{build_router, AppState};
use wallet_service::capture::SpendPolicy;
use wallet_service::events::EventQueue;
use wallet_service::gateway::{StubBankGateway, StubNotifier, StubPinVerifier};
use wallet_service::intents::{self, IntentStatus};
use wallet_service::settlement;

const PIN: &str = "1234";

async fn connect() -> PgPool {
    let dsn = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this ignored test");
    let pool = PgPool::connect(&dsn).await.unwrap();
    ensure_schema(&pool).await;
    pool
}

async fn ensure_schema(pool: &PgPool) {
    pool.execute(
        r#"
    CREATE TABLE IF NOT EXISTS wallets (
        id UUID PRIMARY KEY,
        owner_type TEXT NOT NULL,
        owner_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE TABLE IF NOT EXISTS wallet_store_balances (
        wallet_id UUID NOT NULL,
        store_id UUID NOT NULL,
        balance BIGINT NOT NULL CHECK (balance >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (wallet_id, store_id)
    );
    CREATE TABLE IF NOT EXISTS wallet_store_lots (
        id UUID PRIMARY KEY,
        wallet_id UUID NOT NULL,
        store_id UUID NOT NULL,
        amount_total BIGINT NOT NULL,
        amount_remaining BIGINT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        source_type TEXT NOT NULL,
        status TEXT NOT NULL,
        contributor_wallet_id UUID NULL,
        origin_charge_tx_id UUID NULL,
        CHECK (amount_remaining >= 0 AND amount_remaining <= amount_total)
    );
    CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        wallet_id UUID NOT NULL,
        customer_id UUID NOT NULL,
        store_id UUID NOT NULL,
        tx_type TEXT NOT NULL,
        amount BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        ref_transaction_id UUID NULL REFERENCES transactions(id)
    );
    CREATE TABLE IF NOT EXISTS transaction_items (
        id UUID PRIMARY KEY,
        transaction_id UUID NOT NULL,
        menu_id UUID NOT NULL,
        name TEXT NOT NULL,
        unit_price BIGINT NOT NULL,
        quantity INT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS wallet_lot_moves (
        id UUID PRIMARY KEY,
        transaction_id UUID NOT NULL,
        lot_id UUID NOT NULL,
        delta BIGINT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS payment_intents (
        id UUID PRIMARY KEY,
        public_id UUID NOT NULL UNIQUE,
        qr_token_id UUID NOT NULL UNIQUE,
        customer_id UUID NOT NULL,
        store_id UUID NOT NULL,
        wallet_id UUID NOT NULL,
        amount BIGINT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        approved_at TIMESTAMPTZ NULL,
        completed_at TIMESTAMPTZ NULL,
        declined_at TIMESTAMPTZ NULL,
        canceled_at TIMESTAMPTZ NULL,
        use_transaction_id UUID NULL,
        version INT NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS payment_intent_items (
        id UUID PRIMARY KEY,
        intent_id UUID NOT NULL,
        menu_id UUID NOT NULL,
        name TEXT NOT NULL,
        unit_price BIGINT NOT NULL,
        quantity INT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        id UUID PRIMARY KEY,
        actor_type TEXT NOT NULL,
        actor_id UUID NOT NULL,
        method_path TEXT NOT NULL,
        key_uuid UUID NOT NULL,
        status TEXT NOT NULL,
        body_hash TEXT NOT NULL,
        response_status INT NULL,
        response_snapshot JSONB NULL,
        resource_public_id UUID NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (actor_type, actor_id, method_path, key_uuid)
    );
    CREATE TABLE IF NOT EXISTS settlement_tasks (
        id UUID PRIMARY KEY,
        transaction_id UUID NOT NULL UNIQUE,
        store_id UUID NOT NULL,
        amount BIGINT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        locked_at TIMESTAMPTZ NULL,
        completed_at TIMESTAMPTZ NULL,
        failure_reason TEXT NULL
    );
    CREATE TABLE IF NOT EXISTS settlement_cutover (
        singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
        last_cutover_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS menus (
        id UUID PRIMARY KEY,
        store_id UUID NOT NULL,
        name TEXT NOT NULL,
        price BIGINT NOT NULL,
        available BOOLEAN NOT NULL DEFAULT TRUE
    );
    CREATE TABLE IF NOT EXISTS qr_tokens (
        id UUID PRIMARY KEY,
        mode TEXT NOT NULL,
        bound_store_id UUID NOT NULL,
        customer_id UUID NOT NULL,
        wallet_id UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        state TEXT NOT NULL
    );
    "#,
    )
    .await
    .unwrap();
}

fn app_with(pool: PgPool, bank: StubBankGateway) -> axum::Router {
    let state = AppState {
        db: pool,
        bank: Arc::new(bank),
        pin: Arc::new(StubPinVerifier { accepted_pin: PIN.into() }),
        events: EventQueue::spawn(Arc::new(StubNotifier)),
        spend_policy: SpendPolicy::default(),
        charge_lot_validity_days: 365,
    };
    build_router(state)
}

struct Fixture {
    customer_id: Uuid,
    wallet_id: Uuid,
    store_id: Uuid,
    menu_id: Uuid,
    qr_token_id: Uuid,
}

async fn seed_fixture(pool: &PgPool, menu_price: i64) -> Fixture {
    let f = Fixture {
        customer_id: Uuid::new_v4(),
        wallet_id: Uuid::new_v4(),
        store_id: Uuid::new_v4(),
        menu_id: Uuid::new_v4(),
        qr_token_id: Uuid::new_v4(),
    };
    sqlx::query("INSERT INTO wallets (id, owner_type, owner_id) VALUES ($1, 'CUSTOMER', $2)")
        .bind(f.wallet_id)
        .bind(f.customer_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO menus (id, store_id, name, price, available) VALUES ($1, $2, 'americano', $3, TRUE)")
        .bind(f.menu_id)
        .bind(f.store_id)
        .bind(menu_price)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO qr_tokens (id, mode, bound_store_id, customer_id, wallet_id, expires_at, state)
         VALUES ($1, 'PAYMENT', $2, $3, $4, NOW() + INTERVAL '10 minutes', 'ACTIVE')",
    )
    .bind(f.qr_token_id)
    .bind(f.store_id)
    .bind(f.customer_id)
    .bind(f.wallet_id)
    .execute(pool)
    .await
    .unwrap();
    f
}

fn request(
    method: &str,
    uri: &str,
    actor_type: &str,
    actor_id: Uuid,
    key: Option<Uuid>,
    body: Option<&Value>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("X-Actor-Type", actor_type)
        .header("X-Actor-ID", actor_id.to_string());
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn charge(app: &axum::Router, f: &Fixture, amount: i64) -> Value {
    let req = request(
        "POST",
        &format!("/api/wallets/{}/stores/{}/charge", f.wallet_id, f.store_id),
        "CUSTOMER",
        f.customer_id,
        Some(Uuid::new_v4()),
        Some(&json!({"amount": amount})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201, "charge should succeed");
    body_json(resp).await
}

async fn assert_balance_matches_lots(pool: &PgPool, wallet_id: Uuid, store_id: Uuid) {
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE((SELECT balance FROM wallet_store_balances WHERE wallet_id = $1 AND store_id = $2), 0)",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_one(pool)
    .await
    .unwrap();
    let lot_sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount_remaining), 0) FROM wallet_store_lots
         WHERE wallet_id = $1 AND store_id = $2 AND status = 'ACTIVE' AND expires_at > NOW()",
    )
    .bind(wallet_id)
    .bind(store_id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(balance, lot_sum, "balance must equal the sum of active lot remainders");
}

#[tokio::test]
#[ignore]
async fn charge_initiate_approve_refund_round_trip() {
    let pool = connect().await;
    let app = app_with(pool.clone(), StubBankGateway::approving());
    let f = seed_fixture(&pool, 600).await;

    // Two charges become two FIFO lots; pin their acquisition order.
    let first = charge(&app, &f, 1000).await;
    let second = charge(&app, &f, 500).await;
    assert_eq!(second["balance"], 1500);
    let first_tx: Uuid = first["transaction_id"].as_str().unwrap().parse().unwrap();
    let second_tx: Uuid = second["transaction_id"].as_str().unwrap().parse().unwrap();
    sqlx::query("UPDATE wallet_store_lots SET acquired_at = NOW() - INTERVAL '2 hours' WHERE origin_charge_tx_id = $1")
        .bind(first_tx)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE wallet_store_lots SET acquired_at = NOW() - INTERVAL '1 hour' WHERE origin_charge_tx_id = $1")
        .bind(second_tx)
        .execute(&pool)
        .await
        .unwrap();
    assert_balance_matches_lots(&pool, f.wallet_id, f.store_id).await;

    // Merchant scans the QR and initiates: 2 x 600 = 1200, priced server-side.
    let initiate_key = Uuid::new_v4();
    let initiate_body = json!({"items": [{"menu_id": f.menu_id, "quantity": 2}]});
    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(initiate_key),
        Some(&initiate_body),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let intent = body_json(resp).await;
    assert_eq!(intent["amount"], 1200);
    assert_eq!(intent["status"], "PENDING");
    let public_id: Uuid = intent["public_id"].as_str().unwrap().parse().unwrap();

    // Idempotent replay: same key, same body, byte-identical response and
    // still exactly one intent.
    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(initiate_key),
        Some(&initiate_body),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let replayed = body_json(resp).await;
    assert_eq!(replayed, intent);
    let intent_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM payment_intents WHERE store_id = $1")
            .bind(f.store_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(intent_count, 1);

    // Same key, different body: hard conflict, no second intent.
    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(initiate_key),
        Some(&json!({"items": [{"menu_id": f.menu_id, "quantity": 1}]})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "idempotency_body_conflict"
    );

    // Wrong PIN rejects without touching the intent.
    let req = request(
        "POST",
        &format!("/payments/{public_id}/approve"),
        "CUSTOMER",
        f.customer_id,
        Some(Uuid::new_v4()),
        Some(&json!({"pin": "9999"})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "pin_invalid");

    // Approval captures 1200: the older lot drains fully, the newer one
    // covers the remainder, the newest stays untouched order-wise.
    let req = request(
        "POST",
        &format!("/payments/{public_id}/approve"),
        "CUSTOMER",
        f.customer_id,
        Some(Uuid::new_v4()),
        Some(&json!({"pin": PIN})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let approved = body_json(resp).await;
    assert_eq!(approved["status"], "COMPLETED");
    let use_tx: Uuid = approved["use_transaction_id"].as_str().unwrap().parse().unwrap();

    let lot1_remaining: i64 = sqlx::query_scalar(
        "SELECT amount_remaining FROM wallet_store_lots WHERE origin_charge_tx_id = $1",
    )
    .bind(first_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    let lot2_remaining: i64 = sqlx::query_scalar(
        "SELECT amount_remaining FROM wallet_store_lots WHERE origin_charge_tx_id = $1",
    )
    .bind(second_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(lot1_remaining, 0, "oldest lot is consumed first");
    assert_eq!(lot2_remaining, 300);
    assert_balance_matches_lots(&pool, f.wallet_id, f.store_id).await;

    let move_sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta), 0) FROM wallet_lot_moves WHERE transaction_id = $1",
    )
    .bind(use_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(move_sum, -1200, "moves must sum to the signed amount");

    let task_status: String =
        sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE transaction_id = $1")
            .bind(use_tx)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(task_status, "PENDING");

    // A second approval attempt is not a replay (new key) and the intent is
    // no longer pending.
    let req = request(
        "POST",
        &format!("/payments/{public_id}/approve"),
        "CUSTOMER",
        f.customer_id,
        Some(Uuid::new_v4()),
        Some(&json!({"pin": PIN})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "intent_not_pending");

    // Full cancel restores balance and every consumed lot exactly.
    let req = request(
        "POST",
        &format!("/api/stores/{}/transactions/{use_tx}/refund", f.store_id),
        "MERCHANT",
        f.store_id,
        Some(Uuid::new_v4()),
        Some(&json!({})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let refund = body_json(resp).await;
    assert_eq!(refund["amount"], 1200);
    let refund_tx = refund["refund_transaction_id"].as_str().unwrap().to_string();

    let lot1_after: i64 = sqlx::query_scalar(
        "SELECT amount_remaining FROM wallet_store_lots WHERE origin_charge_tx_id = $1",
    )
    .bind(first_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    let lot2_after: i64 = sqlx::query_scalar(
        "SELECT amount_remaining FROM wallet_store_lots WHERE origin_charge_tx_id = $1",
    )
    .bind(second_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(lot1_after, 1000);
    assert_eq!(lot2_after, 500);
    assert_balance_matches_lots(&pool, f.wallet_id, f.store_id).await;
    let restored: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta), 0) FROM wallet_lot_moves wm
         JOIN transactions t ON t.id = wm.transaction_id
         WHERE t.ref_transaction_id = $1",
    )
    .bind(use_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(restored, 1200);

    // Replay-safe double cancel: a different key returns the same result and
    // no second CANCEL_USE appears.
    let req = request(
        "POST",
        &format!("/api/stores/{}/transactions/{use_tx}/refund", f.store_id),
        "MERCHANT",
        f.store_id,
        Some(Uuid::new_v4()),
        Some(&json!({})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let refund_again = body_json(resp).await;
    assert_eq!(refund_again["refund_transaction_id"].as_str().unwrap(), refund_tx);
    let cancel_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions WHERE ref_transaction_id = $1 AND tx_type = 'CANCEL_USE'",
    )
    .bind(use_tx)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(cancel_count, 1);

    // The canceled settlement task stays canceled.
    let task_status: String =
        sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE transaction_id = $1")
            .bind(use_tx)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(task_status, "CANCELED");
}

#[tokio::test]
#[ignore]
async fn expired_intent_is_not_approvable() {
    let pool = connect().await;
    let app = app_with(pool.clone(), StubBankGateway::approving());
    let f = seed_fixture(&pool, 300).await;
    charge(&app, &f, 1000).await;

    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(Uuid::new_v4()),
        Some(&json!({"items": [{"menu_id": f.menu_id, "quantity": 1}]})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let intent = body_json(resp).await;
    let public_id: Uuid = intent["public_id"].as_str().unwrap().parse().unwrap();

    // Push the stored expiry into the past; the row still says PENDING.
    sqlx::query("UPDATE payment_intents SET expires_at = NOW() - INTERVAL '1 second' WHERE public_id = $1")
        .bind(public_id)
        .execute(&pool)
        .await
        .unwrap();

    let req = request(
        "POST",
        &format!("/payments/{public_id}/approve"),
        "CUSTOMER",
        f.customer_id,
        Some(Uuid::new_v4()),
        Some(&json!({"pin": PIN})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "intent_expired");

    // Reads also see it as expired.
    let req = request(
        "GET",
        &format!("/api/payments/intent/{public_id}"),
        "CUSTOMER",
        f.customer_id,
        None,
        None,
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    let detail = body_json(resp).await;
    assert_eq!(detail["status"], "EXPIRED");
}

#[tokio::test]
#[ignore]
async fn concurrent_approvals_have_a_single_winner() {
    let pool = connect().await;
    let app = app_with(pool.clone(), StubBankGateway::approving());
    let f = seed_fixture(&pool, 250).await;
    charge(&app, &f, 1000).await;

    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(Uuid::new_v4()),
        Some(&json!({"items": [{"menu_id": f.menu_id, "quantity": 1}]})),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    let intent = body_json(resp).await;
    let public_id: Uuid = intent["public_id"].as_str().unwrap().parse().unwrap();

    // Both contenders read version 0; the conditional update admits one.
    let mut conn = pool.acquire().await.unwrap();
    let row = intents::get_by_public_id(&mut conn, public_id).await.unwrap().unwrap();
    let first = intents::try_transition(&mut conn, row.id, IntentStatus::Pending, IntentStatus::Approved, row.version)
        .await
        .unwrap();
    let second = intents::try_transition(&mut conn, row.id, IntentStatus::Pending, IntentStatus::Approved, row.version)
        .await
        .unwrap();
    assert!(first);
    assert!(!second, "second writer must observe a version conflict");
}

#[tokio::test]
#[ignore]
async fn settlement_two_phase_batch() {
    let pool = connect().await;
    let store_a = Uuid::new_v4();
    let store_b = Uuid::new_v4();

    {
        let mut conn = pool.acquire().await.unwrap();
        settlement::ensure_cutover_row(&mut conn).await.unwrap();
    }
    sqlx::query("UPDATE settlement_cutover SET last_cutover_at = NOW() - INTERVAL '8 days'")
        .execute(&pool)
        .await
        .unwrap();

    // Three tasks inside the elapsed billing week, one outside it.
    let mut in_window = Vec::new();
    for (store, amount) in [(store_a, 700), (store_a, 300), (store_b, 500)] {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO settlement_tasks (id, transaction_id, store_id, amount, status, created_at)
             VALUES ($1, $2, $3, $4, 'PENDING', NOW() - INTERVAL '5 days')",
        )
        .bind(id)
        .bind(Uuid::new_v4())
        .bind(store)
        .bind(amount)
        .execute(&pool)
        .await
        .unwrap();
        in_window.push(id);
    }
    let fresh_task = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO settlement_tasks (id, transaction_id, store_id, amount, status, created_at)
         VALUES ($1, $2, $3, 900, 'PENDING', NOW())",
    )
    .bind(fresh_task)
    .bind(Uuid::new_v4())
    .bind(store_a)
    .execute(&pool)
    .await
    .unwrap();

    settlement::lock_due_tasks(&pool).await.unwrap();
    for id in &in_window {
        let status: String = sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "LOCKED");
    }
    let fresh_status: String = sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE id = $1")
        .bind(fresh_task)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fresh_status, "PENDING", "tasks outside the window stay pending");

    // Store B's deposit fails; store A settles regardless.
    let bank = StubBankGateway { failing_stores: vec![store_b] };
    settlement::disburse_locked(&pool, &bank).await.unwrap();

    for id in &in_window[..2] {
        let status: String = sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "COMPLETED");
    }
    let status_b: String = sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE id = $1")
        .bind(in_window[2])
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status_b, "FAILED");

    // The failed group is re-locked on the next weekly cutover.
    sqlx::query("UPDATE settlement_cutover SET last_cutover_at = NOW() - INTERVAL '8 days'")
        .execute(&pool)
        .await
        .unwrap();
    settlement::lock_due_tasks(&pool).await.unwrap();
    let status_b: String = sqlx::query_scalar("SELECT status FROM settlement_tasks WHERE id = $1")
        .bind(in_window[2])
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status_b, "LOCKED");
}

#[tokio::test]
#[ignore]
async fn in_flight_idempotency_key_signals_retry_later() {
    let pool = connect().await;
    let app = app_with(pool.clone(), StubBankGateway::approving());
    let f = seed_fixture(&pool, 400).await;

    let key = Uuid::new_v4();
    let body = json!({"items": [{"menu_id": f.menu_id, "quantity": 1}]});
    let hash = wallet_service::idempotency::canonical_body_hash(&body);
    let actor = common_security::ActorContext {
        actor_type: common_security::ActorType::Merchant,
        actor_id: f.store_id,
        trace_id: None,
    };

    // Simulate a first request still in flight: the record exists and is
    // IN_PROGRESS.
    let mut conn = pool.acquire().await.unwrap();
    let (_, created) = wallet_service::idempotency::begin_or_load(
        &mut conn,
        &actor,
        &format!("POST /cpqr/{}/initiate", f.qr_token_id),
        key,
        &hash,
    )
    .await
    .unwrap();
    assert!(created);

    let req = request(
        "POST",
        &format!("/cpqr/{}/initiate", f.qr_token_id),
        "MERCHANT",
        f.store_id,
        Some(key),
        Some(&body),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    assert!(resp.headers().get("Retry-After").is_some());
}
