use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use wallet_service::app::{build_router, AppState};
use wallet_service::capture::SpendPolicy;
use wallet_service::events::EventQueue;
use wallet_service::gateway::{
    BankGateway, HttpBankGateway, HttpNotifier, HttpPinVerifier, Notifier, PinVerifier,
};
use wallet_service::intents;
use wallet_service::settlement;

const DEFAULT_CHARGE_LOT_VALIDITY_DAYS: i64 = 1825; // five years
const DEFAULT_SETTLEMENT_CHECK_SECS: u64 = 3600;
const DEFAULT_INTENT_SWEEP_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = PgPool::connect(&database_url).await?;

    let http_client = reqwest::Client::new();
    let bank_url = env::var("BANK_API_URL").unwrap_or_else(|_| "http://localhost:8091".to_string());
    let pin_url = env::var("PIN_AUTH_URL").unwrap_or_else(|_| "http://localhost:8092".to_string());
    let notify_url = env::var("NOTIFY_URL").unwrap_or_else(|_| "http://localhost:8093".to_string());
    let bank: Arc<dyn BankGateway> = Arc::new(HttpBankGateway::new(http_client.clone(), bank_url));
    let pin: Arc<dyn PinVerifier> = Arc::new(HttpPinVerifier::new(http_client.clone(), pin_url));
    let notifier: Arc<dyn Notifier> = Arc::new(HttpNotifier::new(http_client, notify_url));

    #[cfg(any(feature = "kafka", feature = "kafka-producer"))]
    let events = {
        let bootstrap = env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".into());
        let producer: rdkafka::producer::FutureProducer = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .create()?;
        EventQueue::spawn_with_kafka(notifier, producer)
    };
    #[cfg(not(any(feature = "kafka", feature = "kafka-producer")))]
    let events = EventQueue::spawn(notifier);

    let spend_policy = SpendPolicy {
        daily_cap: env::var("WALLET_DAILY_SPEND_CAP").ok().and_then(|v| v.parse().ok()),
    };
    let charge_lot_validity_days = env::var("CHARGE_LOT_VALIDITY_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHARGE_LOT_VALIDITY_DAYS);

    {
        let mut conn = db.acquire().await?;
        settlement::ensure_cutover_row(&mut conn).await?;
    }

    let state = AppState {
        db: db.clone(),
        bank: bank.clone(),
        pin,
        events,
        spend_policy,
        charge_lot_validity_days,
    };

    let settlement_check = env::var("SETTLEMENT_CHECK_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SETTLEMENT_CHECK_SECS);
    settlement::spawn_settlement_scheduler(db.clone(), bank, Duration::from_secs(settlement_check));
    spawn_intent_sweeper(db.clone());

    let app = build_router(state);
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting wallet-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_intent_sweeper(db: PgPool) {
    let sweep_secs = env::var("INTENT_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INTENT_SWEEP_SECS);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match db.acquire().await {
                Ok(mut conn) => {
                    if let Err(err) = intents::expire_stale_intents(&mut conn).await {
                        warn!(?err, "intent expiry sweep error");
                    }
                }
                Err(err) => warn!(?err, "intent sweeper could not acquire connection"),
            }
        }
    });
}
