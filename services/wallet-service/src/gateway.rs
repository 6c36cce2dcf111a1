use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External reference number for a bank call: time component plus a random
/// suffix, never an in-process counter, so references stay unique across
/// restarts.
pub fn external_reference() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankApproval {
    pub success: bool,
    pub external_transaction_id: Option<String>,
}

/// Bank/card API. Every call is fallible network I/O; callers branch on
/// success explicitly and map transport errors to the external-failure kind.
#[async_trait::async_trait]
pub trait BankGateway: Send + Sync {
    async fn request_card_payment(&self, reference: &str, amount: i64) -> Result<BankApproval>;
    async fn request_account_deposit(
        &self,
        store_id: Uuid,
        reference: &str,
        amount: i64,
    ) -> Result<BankApproval>;
    async fn request_card_cancel(&self, external_transaction_id: &str) -> Result<bool>;
}

pub struct HttpBankGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBankGateway {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait::async_trait]
impl BankGateway for HttpBankGateway {
    async fn request_card_payment(&self, reference: &str, amount: i64) -> Result<BankApproval> {
        let resp = self
            .client
            .post(format!("{}/card/payments", self.base_url))
            .json(&serde_json::json!({ "reference": reference, "amount": amount }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<BankApproval>().await?)
    }

    async fn request_account_deposit(
        &self,
        store_id: Uuid,
        reference: &str,
        amount: i64,
    ) -> Result<BankApproval> {
        let resp = self
            .client
            .post(format!("{}/account/deposits", self.base_url))
            .json(&serde_json::json!({
                "storeId": store_id,
                "reference": reference,
                "amount": amount,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<BankApproval>().await?)
    }

    async fn request_card_cancel(&self, external_transaction_id: &str) -> Result<bool> {
        let resp = self
            .client
            .post(format!("{}/card/cancellations", self.base_url))
            .json(&serde_json::json!({ "externalTransactionId": external_transaction_id }))
            .send()
            .await?
            .error_for_status()?;
        let body: BankApproval = resp.json().await?;
        Ok(body.success)
    }
}

/// Deterministic stand-in for tests: deposits fail for the configured
/// stores, everything else approves.
pub struct StubBankGateway {
    pub failing_stores: Vec<Uuid>,
}

impl StubBankGateway {
    pub fn approving() -> Self {
        Self { failing_stores: Vec::new() }
    }
}

#[async_trait::async_trait]
impl BankGateway for StubBankGateway {
    async fn request_card_payment(&self, reference: &str, _amount: i64) -> Result<BankApproval> {
        Ok(BankApproval {
            success: true,
            external_transaction_id: Some(format!("{reference}-card")),
        })
    }

    async fn request_account_deposit(
        &self,
        store_id: Uuid,
        reference: &str,
        _amount: i64,
    ) -> Result<BankApproval> {
        if self.failing_stores.contains(&store_id) {
            anyhow::bail!("deposit rejected for store {store_id}");
        }
        Ok(BankApproval {
            success: true,
            external_transaction_id: Some(format!("{reference}-deposit")),
        })
    }

    async fn request_card_cancel(&self, _external_transaction_id: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Valid,
    Invalid,
    /// Too many consecutive failures; the PIN service enforces the cooldown.
    Locked,
}

#[async_trait::async_trait]
pub trait PinVerifier: Send + Sync {
    async fn verify(&self, customer_id: Uuid, raw_pin: &str) -> Result<PinOutcome>;
}

pub struct HttpPinVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPinVerifier {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct PinVerifyResponse {
    valid: bool,
    #[serde(default)]
    locked: bool,
}

#[async_trait::async_trait]
impl PinVerifier for HttpPinVerifier {
    async fn verify(&self, customer_id: Uuid, raw_pin: &str) -> Result<PinOutcome> {
        let resp = self
            .client
            .post(format!("{}/pin/verify", self.base_url))
            .json(&serde_json::json!({ "customerId": customer_id, "pin": raw_pin }))
            .send()
            .await?
            .error_for_status()?;
        let body: PinVerifyResponse = resp.json().await?;
        if body.locked {
            return Ok(PinOutcome::Locked);
        }
        Ok(if body.valid { PinOutcome::Valid } else { PinOutcome::Invalid })
    }
}

pub struct StubPinVerifier {
    pub accepted_pin: String,
}

#[async_trait::async_trait]
impl PinVerifier for StubPinVerifier {
    async fn verify(&self, _customer_id: Uuid, raw_pin: &str) -> Result<PinOutcome> {
        Ok(if raw_pin == self.accepted_pin {
            PinOutcome::Valid
        } else {
            PinOutcome::Invalid
        })
    }
}

/// Push-notification collaborator; delivery is best-effort and failures are
/// logged by the event worker, never propagated into a transaction.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, actor_id: Uuid, kind: &str, message: &str) -> Result<()>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait::async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, actor_id: Uuid, kind: &str, message: &str) -> Result<()> {
        self.client
            .post(format!("{}/notifications", self.base_url))
            .json(&serde_json::json!({
                "actorId": actor_id,
                "kind": kind,
                "message": message,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct StubNotifier;

#[async_trait::async_trait]
impl Notifier for StubNotifier {
    async fn notify(&self, _actor_id: Uuid, _kind: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_reference_shape_and_uniqueness() {
        let a = external_reference();
        let b = external_reference();
        assert_ne!(a, b);
        let (stamp, suffix) = a.split_once('-').unwrap();
        assert_eq!(stamp.len(), 14);
        assert_eq!(suffix.len(), 8);
    }

    #[tokio::test]
    async fn test_stub_gateway_fails_configured_store() {
        let bad = Uuid::new_v4();
        let gw = StubBankGateway { failing_stores: vec![bad] };
        assert!(gw.request_account_deposit(bad, "r", 100).await.is_err());
        assert!(gw
            .request_account_deposit(Uuid::new_v4(), "r", 100)
            .await
            .unwrap()
            .success);
    }
}
