use super::appointment::LineItem;
use super::ids::{AppointmentId, UserId};
use super::ledger::Leg;
use super::money::Money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the penalty window a cancellation landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationWindow {
    /// Far enough out for a full refund.
    Lenient,
    /// Inside the penalty window; the refund percentage shrinks.
    Penalty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerShare {
    pub cleaner_id: UserId,
    pub amount: Money,
}

/// Pure result of applying the cancellation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationOutcome {
    pub days_until: i64,
    pub window: CancellationWindow,
    pub total_charge: Money,
    pub refund_amount: Money,
    pub refund_percentage: Decimal,
    pub cancellation_fee: Money,
    pub cleaner_payout: Money,
    pub cleaner_shares: Vec<CleanerShare>,
    /// Retained revenue the platform keeps after the cleaner payout.
    pub platform_revenue: Money,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    NotApplicable,
    Charged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalCharges {
    pub items: Vec<LineItem>,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundDetails {
    pub eligible: bool,
    pub amount: Money,
    pub percentage: Decimal,
    pub reason: String,
    pub payment_method_label: String,
    pub gateway_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDetails {
    pub applicable: bool,
    pub amount: Money,
    pub status: FeeStatus,
    pub gateway_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerPayoutLine {
    pub cleaner_id: UserId,
    pub amount: Money,
    pub gateway_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerCompensation {
    pub total: Money,
    pub shares: Vec<CleanerPayoutLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSummary {
    pub fee_revenue: Money,
    pub retained_revenue: Money,
    pub total: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetCostSummary {
    pub total_charged: Money,
    pub refunded: Money,
    pub fee_charged: Money,
    /// charged - refunded + fee
    pub net_cost: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppealEligibility {
    pub eligible: bool,
    pub deadline: DateTime<Utc>,
}

/// Financial breakdown of a settled cancellation, fed to receipts and client display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub confirmation_id: String,
    pub appointment_id: AppointmentId,
    pub cancelled_at: DateTime<Utc>,
    pub days_until: i64,
    pub window: CancellationWindow,
    pub original_charges: OriginalCharges,
    pub refund: RefundDetails,
    pub cancellation_fee: FeeDetails,
    pub cleaner_compensation: CleanerCompensation,
    pub platform: PlatformSummary,
    pub net_cost: NetCostSummary,
    pub appeal: AppealEligibility,
}

/// Money moved to honour an approved appeal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliefSummary {
    pub fee_reversed: Money,
    pub refunded: Money,
    pub payout_restored: Money,
    pub entry_ids: Vec<Uuid>,
}

impl ReliefSummary {
    pub fn total(&self) -> Money {
        self.fee_reversed + self.refunded + self.payout_restored
    }
}

/// Operator correction. Accounts and parties are chosen explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAdjustment {
    /// Caller-supplied so a resubmitted adjustment is posted once.
    pub adjustment_id: Uuid,
    pub appointment_id: AppointmentId,
    pub amount: Money,
    pub debit: Leg,
    pub credit: Leg,
    pub reason: String,
    pub reverses_entry_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub still_pending: usize,
}
