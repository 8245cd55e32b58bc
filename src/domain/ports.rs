use super::appeal::Appeal;
use super::audit::AuditEvent;
use super::gateway::{GatewayError, GatewayReceipt, GatewayRequest};
use super::ids::AppointmentId;
use super::ledger::{
    GatewayObjectRef, LedgerEntry, PendingPosting, PostOutcome, PostingPair, ReconciliationStatus,
};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Append-only double-entry store.
///
/// Implementations must make `post_pair` a single transactional write that
/// (1) returns the original pair when the idempotency key or gateway key was seen
/// before and (2) rejects any pair that fails `LedgerTotals::admit` for its
/// appointment. There is deliberately no update or delete of financial fields.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn post_pair(&self, pair: PostingPair) -> Result<PostOutcome>;
    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<PostingPair>>;
    async fn entries_for_appointment(&self, appointment_id: AppointmentId)
    -> Result<Vec<LedgerEntry>>;
    async fn all_entries(&self) -> Result<Vec<LedgerEntry>>;
    /// Updates only the reconciliation annotation of an entry.
    async fn mark_reconciliation(&self, entry_id: Uuid, status: ReconciliationStatus)
    -> Result<()>;
    async fn record_pending(&self, pending: PendingPosting) -> Result<()>;
    async fn pending_postings(&self) -> Result<Vec<PendingPosting>>;
    async fn clear_pending(&self, idempotency_key: &str) -> Result<()>;
}

#[async_trait]
pub trait AppealStore: Send + Sync {
    async fn store(&self, appeal: Appeal) -> Result<()>;
    async fn get(&self, appeal_id: Uuid) -> Result<Option<Appeal>>;
    async fn get_all(&self) -> Result<Vec<Appeal>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
    /// Every event, ordered by `occurred_at` then insertion.
    async fn get_all(&self) -> Result<Vec<AuditEvent>>;
}

/// The external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn capture(&self, request: &GatewayRequest)
    -> std::result::Result<GatewayReceipt, GatewayError>;
    async fn refund(&self, request: &GatewayRequest)
    -> std::result::Result<GatewayReceipt, GatewayError>;
    async fn transfer(&self, request: &GatewayRequest)
    -> std::result::Result<GatewayReceipt, GatewayError>;
    /// The processor's authoritative record of an object.
    async fn retrieve(
        &self,
        object: &GatewayObjectRef,
    ) -> std::result::Result<Option<GatewayReceipt>, GatewayError>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type AppealStoreRef = Arc<dyn AppealStore>;
pub type AuditStoreRef = Arc<dyn AuditStore>;
pub type GatewayRef = Arc<dyn PaymentGateway>;
