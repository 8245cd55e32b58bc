//! A local stand-in for the payment processor.
//!
//! Behaves like the real thing where it matters to the ledger: requests are
//! idempotent by key, refunds cannot exceed what the charge captured, and
//! `retrieve` returns the processor's own record. Failures and drifted amounts
//! can be injected for testing.

use crate::domain::gateway::{GatewayError, GatewayOperation, GatewayReceipt, GatewayRequest};
use crate::domain::ledger::{GatewayObjectRef, GatewayObjectType};
use crate::domain::money::Money;
use crate::domain::ports::PaymentGateway;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct SandboxState {
    by_key: HashMap<String, GatewayReceipt>,
    objects: HashMap<GatewayObjectRef, GatewayReceipt>,
    refunded: HashMap<GatewayObjectRef, Money>,
    failures: VecDeque<GatewayError>,
    /// `None` means the processor has no record of the object.
    overrides: HashMap<GatewayObjectRef, Option<Money>>,
    calls: usize,
}

#[derive(Default, Clone)]
pub struct SandboxGateway {
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` money-moving calls fail with `error`.
    pub async fn fail_next(&self, count: usize, error: GatewayError) {
        let mut state = self.state.lock().await;
        state.failures.extend(std::iter::repeat_n(error, count));
    }

    /// Makes `retrieve` report a different amount, or no record at all.
    pub async fn override_amount(&self, object: GatewayObjectRef, amount: Option<Money>) {
        self.state.lock().await.overrides.insert(object, amount);
    }

    /// Registers an object created on the processor side, such as a dispute.
    pub async fn register(&self, object: GatewayObjectRef, amount: Money) {
        let receipt = GatewayReceipt {
            object: object.clone(),
            amount,
            created_at: Utc::now(),
        };
        self.state.lock().await.objects.insert(object, receipt);
    }

    /// Number of capture, refund and transfer calls received, including failed ones.
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls
    }

    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if let Some(receipt) = state.by_key.get(&request.idempotency_key) {
            return Ok(receipt.clone());
        }
        if request.amount.is_zero() {
            return Err(GatewayError::Declined("amount must be positive".to_string()));
        }

        let (object_type, prefix) = match request.operation {
            GatewayOperation::Capture => (GatewayObjectType::Charge, "ch"),
            GatewayOperation::Refund => (GatewayObjectType::Refund, "re"),
            GatewayOperation::Transfer => (GatewayObjectType::Transfer, "tr"),
        };

        if request.operation == GatewayOperation::Refund {
            let source = request
                .source
                .as_ref()
                .ok_or_else(|| GatewayError::Declined("refund needs a source charge".to_string()))?;
            let captured = state
                .objects
                .get(source)
                .map(|r| r.amount)
                .ok_or_else(|| {
                    GatewayError::Declined(format!("unknown charge {}", source.object_id))
                })?;
            let already = state.refunded.get(source).copied().unwrap_or(Money::ZERO);
            if already + request.amount > captured {
                return Err(GatewayError::Declined(format!(
                    "refund of {} exceeds the {} left on {}",
                    request.amount,
                    captured.saturating_sub(already),
                    source.object_id
                )));
            }
            state.refunded.insert(source.clone(), already + request.amount);
        }

        let digest =
            Uuid::new_v5(&Uuid::NAMESPACE_OID, request.idempotency_key.as_bytes()).simple();
        let object = GatewayObjectRef {
            object_type,
            object_id: format!("{prefix}_{}", &digest.to_string()[..16]),
        };
        let receipt = GatewayReceipt {
            object: object.clone(),
            amount: request.amount,
            created_at: Utc::now(),
        };
        state.by_key.insert(request.idempotency_key.clone(), receipt.clone());
        state.objects.insert(object, receipt.clone());
        Ok(receipt)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn capture(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.execute(request).await
    }

    async fn refund(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.execute(request).await
    }

    async fn transfer(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.execute(request).await
    }

    async fn retrieve(
        &self,
        object: &GatewayObjectRef,
    ) -> Result<Option<GatewayReceipt>, GatewayError> {
        let state = self.state.lock().await;
        let receipt = state.objects.get(object).cloned();
        Ok(match state.overrides.get(object) {
            Some(None) => None,
            Some(Some(amount)) => receipt.map(|r| GatewayReceipt { amount: *amount, ..r }),
            None => receipt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{AppointmentId, UserId};

    fn request(operation: GatewayOperation, key: &str, cents: u64) -> GatewayRequest {
        GatewayRequest {
            operation,
            idempotency_key: key.to_string(),
            amount: Money::from_cents(cents),
            appointment_id: AppointmentId(1),
            party_user_id: Some(UserId(1)),
            source: None,
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_same_key_returns_same_object() {
        let gw = SandboxGateway::new();
        let a = gw.capture(&request(GatewayOperation::Capture, "k1", 100)).await.unwrap();
        let b = gw.capture(&request(GatewayOperation::Capture, "k1", 100)).await.unwrap();
        assert_eq!(a.object, b.object);
        assert!(a.object.object_id.starts_with("ch_"));
    }

    #[tokio::test]
    async fn test_refund_cannot_exceed_charge() {
        let gw = SandboxGateway::new();
        let charge = gw.capture(&request(GatewayOperation::Capture, "c", 100)).await.unwrap();
        let mut refund = request(GatewayOperation::Refund, "r1", 80);
        refund.source = Some(charge.object.clone());
        gw.refund(&refund).await.unwrap();

        let mut second = request(GatewayOperation::Refund, "r2", 30);
        second.source = Some(charge.object);
        assert!(matches!(gw.refund(&second).await, Err(GatewayError::Declined(_))));
    }

    #[tokio::test]
    async fn test_injected_failures_and_overrides() {
        let gw = SandboxGateway::new();
        gw.fail_next(1, GatewayError::Transient("timeout".to_string())).await;
        let req = request(GatewayOperation::Transfer, "t", 50);
        assert!(gw.transfer(&req).await.is_err());
        let receipt = gw.transfer(&req).await.unwrap();
        assert_eq!(gw.call_count().await, 2);

        gw.override_amount(receipt.object.clone(), Some(Money::from_cents(40))).await;
        let seen = gw.retrieve(&receipt.object).await.unwrap().unwrap();
        assert_eq!(seen.amount, Money::from_cents(40));

        gw.override_amount(receipt.object.clone(), None).await;
        assert!(gw.retrieve(&receipt.object).await.unwrap().is_none());
    }
}
