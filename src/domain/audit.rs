use super::appeal::{Actor, Appeal};
use super::appointment::CancelledBy;
use super::ids::AppointmentId;
use super::ledger::{EntryType, GatewayObjectRef, LedgerTotals};
use super::money::Money;
use super::settlement::CancellationOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CancellationInitiated,
    CancellationOutcomeComputed,
    BookingChargeSucceeded,
    BookingChargeFailed,
    FeeChargeSucceeded,
    FeeChargeFailed,
    RefundCompleted,
    RefundFailed,
    PayoutTransferred,
    PayoutFailed,
    LedgerEntriesPosted,
    LedgerPostRetried,
    LedgerInvariantViolation,
    SettlementPending,
    SettlementCompleted,
    WebhookProcessed,
    ManualAdjustmentPosted,
    AppealSubmitted,
    AppealDocumentsAdded,
    AppealStatusChanged,
    AppealEscalated,
    AppealResolved,
    AppealReliefSettled,
    AppealClosed,
    ReconciliationMatched,
    ReconciliationDiscrepancy,
    ReconciliationRunCompleted,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CancellationInitiated => "cancellation_initiated",
            AuditEventType::CancellationOutcomeComputed => "cancellation_outcome_computed",
            AuditEventType::BookingChargeSucceeded => "booking_charge_succeeded",
            AuditEventType::BookingChargeFailed => "booking_charge_failed",
            AuditEventType::FeeChargeSucceeded => "fee_charge_succeeded",
            AuditEventType::FeeChargeFailed => "fee_charge_failed",
            AuditEventType::RefundCompleted => "refund_completed",
            AuditEventType::RefundFailed => "refund_failed",
            AuditEventType::PayoutTransferred => "payout_transferred",
            AuditEventType::PayoutFailed => "payout_failed",
            AuditEventType::LedgerEntriesPosted => "ledger_entries_posted",
            AuditEventType::LedgerPostRetried => "ledger_post_retried",
            AuditEventType::LedgerInvariantViolation => "ledger_invariant_violation",
            AuditEventType::SettlementPending => "settlement_pending",
            AuditEventType::SettlementCompleted => "settlement_completed",
            AuditEventType::WebhookProcessed => "webhook_processed",
            AuditEventType::ManualAdjustmentPosted => "manual_adjustment_posted",
            AuditEventType::AppealSubmitted => "appeal_submitted",
            AuditEventType::AppealDocumentsAdded => "appeal_documents_added",
            AuditEventType::AppealStatusChanged => "appeal_status_changed",
            AuditEventType::AppealEscalated => "appeal_escalated",
            AuditEventType::AppealResolved => "appeal_resolved",
            AuditEventType::AppealReliefSettled => "appeal_relief_settled",
            AuditEventType::AppealClosed => "appeal_closed",
            AuditEventType::ReconciliationMatched => "reconciliation_matched",
            AuditEventType::ReconciliationDiscrepancy => "reconciliation_discrepancy",
            AuditEventType::ReconciliationRunCompleted => "reconciliation_run_completed",
        }
    }

    /// Events an operator must look at.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AuditEventType::LedgerInvariantViolation
                | AuditEventType::SettlementPending
                | AuditEventType::ReconciliationDiscrepancy
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of an audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    None,
    Cancellation {
        cancelled_by: CancelledBy,
    },
    Outcome {
        outcome: Box<CancellationOutcome>,
    },
    GatewayCall {
        operation: String,
        amount: Money,
        idempotency_key: String,
        object: Option<GatewayObjectRef>,
        attempts: usize,
        error: Option<String>,
    },
    Posting {
        entry_type: EntryType,
        amount: Money,
        entry_ids: Vec<Uuid>,
        duplicate: bool,
    },
    Invariant {
        entry_type: EntryType,
        amount: Money,
        detail: String,
    },
    Settlement {
        confirmation_id: String,
        net_cost: Money,
    },
    Webhook {
        event_id: String,
        object: GatewayObjectRef,
    },
    Reconciliation {
        object: GatewayObjectRef,
        local_amount: Money,
        gateway_amount: Option<Money>,
        discrepancy: i64,
        entry_ids: Vec<Uuid>,
    },
    ReconciliationRun {
        objects_checked: usize,
        matched: usize,
        discrepancies: usize,
    },
    Note {
        text: String,
    },
}

/// Before/after state captured with each event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateSnapshot {
    LedgerTotals(LedgerTotals),
    Appeal(Box<Appeal>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub actor: Actor,
    pub appointment_id: Option<AppointmentId>,
    pub appeal_id: Option<Uuid>,
    /// Correlates every event of one operation with the entries it posted.
    pub request_id: Option<Uuid>,
    pub event_data: EventData,
    pub previous_state: Option<StateSnapshot>,
    pub new_state: Option<StateSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, actor: Actor, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            actor,
            appointment_id: None,
            appeal_id: None,
            request_id: None,
            event_data: EventData::None,
            previous_state: None,
            new_state: None,
            occurred_at,
        }
    }

    pub fn appointment(mut self, id: AppointmentId) -> Self {
        self.appointment_id = Some(id);
        self
    }

    pub fn appeal(mut self, id: Uuid) -> Self {
        self.appeal_id = Some(id);
        self
    }

    pub fn request(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn data(mut self, data: EventData) -> Self {
        self.event_data = data;
        self
    }

    pub fn states(mut self, previous: Option<StateSnapshot>, new: Option<StateSnapshot>) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }
}
