use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::gateway::Notifier;

const DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 200;

/// A notification enqueued after its ledger transaction committed. Delivery
/// is fire-and-forget from the producer's point of view; the worker owns
/// retries and the dead-letter log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEvent {
    pub actor_id: Uuid,
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl WalletEvent {
    pub fn new(actor_id: Uuid, kind: &str, message: String) -> Self {
        Self {
            actor_id,
            kind: kind.to_string(),
            message,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::UnboundedSender<WalletEvent>,
}

impl EventQueue {
    /// Spawns the delivery worker and hands back the publish handle.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WalletEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                deliver_with_retry(notifier.as_ref(), &event).await;
            }
        });
        Self { sender }
    }

    /// Worker that also mirrors every event onto the Kafka audit topic.
    #[cfg(any(feature = "kafka", feature = "kafka-producer"))]
    pub fn spawn_with_kafka(
        notifier: Arc<dyn Notifier>,
        kafka_producer: rdkafka::producer::FutureProducer,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WalletEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                deliver_with_retry(notifier.as_ref(), &event).await;
                emit_kafka(&kafka_producer, &event).await;
            }
        });
        Self { sender }
    }

    /// Never blocks and never fails the caller; a closed worker is logged
    /// and the event dropped.
    pub fn publish(&self, event: WalletEvent) {
        if self.sender.send(event).is_err() {
            error!("event worker is gone; notification dropped");
        }
    }
}

async fn deliver_with_retry(notifier: &dyn Notifier, event: &WalletEvent) {
    for attempt in 1..=DELIVERY_ATTEMPTS {
        match notifier.notify(event.actor_id, &event.kind, &event.message).await {
            Ok(()) => return,
            Err(err) if attempt < DELIVERY_ATTEMPTS => {
                warn!(error = %err, kind = %event.kind, attempt, "notification delivery failed; retrying");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
            }
            Err(err) => {
                // dead letter
                error!(
                    error = %err,
                    kind = %event.kind,
                    actor_id = %event.actor_id,
                    payload = %serde_json::to_string(event).unwrap_or_default(),
                    "notification delivery exhausted retries"
                );
            }
        }
    }
}

#[cfg(any(feature = "kafka", feature = "kafka-producer"))]
async fn emit_kafka(producer: &rdkafka::producer::FutureProducer, event: &WalletEvent) {
    use rdkafka::producer::FutureRecord;
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(_) => return,
    };
    let key = event.actor_id.to_string();
    if let Err(e) = producer
        .send(
            FutureRecord::to("wallet.events").payload(&payload).key(&key),
            Duration::from_secs(0),
        )
        .await
    {
        warn!(error = ?e, "failed to emit wallet event to kafka");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyNotifier {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, _actor_id: Uuid, _kind: &str, _message: &str) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_retries_until_success() {
        let notifier = FlakyNotifier { calls: AtomicU32::new(0), fail_first: 2 };
        let event = WalletEvent::new(Uuid::new_v4(), "PAYMENT_COMPLETED", "ok".into());
        deliver_with_retry(&notifier, &event).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_do_not_panic() {
        let notifier = FlakyNotifier { calls: AtomicU32::new(0), fail_first: u32::MAX };
        let event = WalletEvent::new(Uuid::new_v4(), "REFUND_COMPLETED", "ok".into());
        deliver_with_retry(&notifier, &event).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), DELIVERY_ATTEMPTS);
    }
}
