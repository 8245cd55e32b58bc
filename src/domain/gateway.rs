use super::ids::{AppointmentId, UserId};
use super::ledger::GatewayObjectRef;
use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    Capture,
    Refund,
    Transfer,
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayOperation::Capture => "capture",
            GatewayOperation::Refund => "refund",
            GatewayOperation::Transfer => "transfer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub operation: GatewayOperation,
    /// Deterministic key; the gateway returns the original receipt on replay.
    pub idempotency_key: String,
    pub amount: Money,
    pub appointment_id: AppointmentId,
    /// Payer for captures, payee for refunds and transfers.
    pub party_user_id: Option<UserId>,
    /// The charge a refund is issued against.
    pub source: Option<GatewayObjectRef>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub object: GatewayObjectRef,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network or processor hiccup; safe to retry with the same idempotency key.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// The processor refused the request; retrying will not help.
    #[error("gateway declined the request: {0}")]
    Declined(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Processor-initiated notification. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub appointment_id: AppointmentId,
    pub homeowner_id: UserId,
    pub occurred_at: DateTime<Utc>,
    pub kind: WebhookKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookKind {
    /// A charge settled; `processing_fee` is what the processor kept.
    ChargeSucceeded {
        charge: GatewayObjectRef,
        processing_fee: Money,
    },
    DisputeOpened {
        dispute: GatewayObjectRef,
        amount: Money,
    },
    DisputeWon {
        dispute: GatewayObjectRef,
        amount: Money,
    },
}

impl WebhookKind {
    pub fn object(&self) -> &GatewayObjectRef {
        match self {
            WebhookKind::ChargeSucceeded { charge, .. } => charge,
            WebhookKind::DisputeOpened { dispute, .. }
            | WebhookKind::DisputeWon { dispute, .. } => dispute,
        }
    }
}
