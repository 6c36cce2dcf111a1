pub mod app;
pub mod capture;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod intent_handlers;
pub mod intents;
pub mod ledger;
pub mod refund_handlers;
pub mod settlement;
pub mod wallet_handlers;

pub use app::{build_router, AppState};
