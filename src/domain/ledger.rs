//! Double-entry ledger facts.
//!
//! Every economic event is recorded as a [`PostingPair`]: one debit and one credit of
//! the same amount, cross-linked through `related_entry_id`. Entries are never
//! updated or deleted; corrections are new pairs whose metadata points at the
//! original entry.

use super::ids::{AppointmentId, UserId};
use super::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    BookingRevenue,
    AddonLinens,
    AddonTimeWindow,
    AddonHighVolume,
    AddonLastMinute,
    CancellationFeeRevenue,
    CancellationRefund,
    CancellationPartialRefund,
    CleanerPayoutJob,
    CleanerPayoutCancellation,
    CleanerBonus,
    PlatformFeeBooking,
    PlatformFeeCancellation,
    AppealRefund,
    AppealFeeReversal,
    ManualAdjustment,
    StripeFee,
    DisputeChargeback,
    DisputeReversal,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::BookingRevenue => "booking_revenue",
            EntryType::AddonLinens => "addon_linens",
            EntryType::AddonTimeWindow => "addon_time_window",
            EntryType::AddonHighVolume => "addon_high_volume",
            EntryType::AddonLastMinute => "addon_last_minute",
            EntryType::CancellationFeeRevenue => "cancellation_fee_revenue",
            EntryType::CancellationRefund => "cancellation_refund",
            EntryType::CancellationPartialRefund => "cancellation_partial_refund",
            EntryType::CleanerPayoutJob => "cleaner_payout_job",
            EntryType::CleanerPayoutCancellation => "cleaner_payout_cancellation",
            EntryType::CleanerBonus => "cleaner_bonus",
            EntryType::PlatformFeeBooking => "platform_fee_booking",
            EntryType::PlatformFeeCancellation => "platform_fee_cancellation",
            EntryType::AppealRefund => "appeal_refund",
            EntryType::AppealFeeReversal => "appeal_fee_reversal",
            EntryType::ManualAdjustment => "manual_adjustment",
            EntryType::StripeFee => "stripe_fee",
            EntryType::DisputeChargeback => "dispute_chargeback",
            EntryType::DisputeReversal => "dispute_reversal",
        }
    }

    /// Standard (debit, credit) accounts for the entry type.
    ///
    /// `None` for manual adjustments, whose accounts are chosen by the operator.
    pub fn standard_accounts(&self) -> Option<(AccountType, AccountType)> {
        use AccountType::*;
        match self {
            EntryType::BookingRevenue
            | EntryType::AddonLinens
            | EntryType::AddonTimeWindow
            | EntryType::AddonHighVolume
            | EntryType::AddonLastMinute => Some((AccountsReceivable, Revenue)),
            EntryType::CancellationFeeRevenue => Some((AccountsReceivable, PlatformRevenue)),
            EntryType::CancellationRefund
            | EntryType::CancellationPartialRefund
            | EntryType::AppealRefund
            | EntryType::DisputeChargeback => Some((RefundsPayable, AccountsReceivable)),
            EntryType::DisputeReversal => Some((AccountsReceivable, RefundsPayable)),
            EntryType::CleanerPayoutJob
            | EntryType::CleanerPayoutCancellation
            | EntryType::CleanerBonus => Some((PayoutsPayable, AccountsReceivable)),
            EntryType::PlatformFeeBooking | EntryType::PlatformFeeCancellation => {
                Some((Revenue, PlatformRevenue))
            }
            EntryType::AppealFeeReversal => Some((PlatformRevenue, AccountsReceivable)),
            EntryType::StripeFee => Some((StripeFees, AccountsReceivable)),
            EntryType::ManualAdjustment => None,
        }
    }

    pub fn is_refund(&self) -> bool {
        matches!(
            self,
            EntryType::CancellationRefund
                | EntryType::CancellationPartialRefund
                | EntryType::AppealRefund
        )
    }

    pub fn is_booking_charge(&self) -> bool {
        matches!(
            self,
            EntryType::BookingRevenue
                | EntryType::AddonLinens
                | EntryType::AddonTimeWindow
                | EntryType::AddonHighVolume
                | EntryType::AddonLastMinute
        )
    }

    pub fn form_1099_eligible(&self) -> bool {
        matches!(
            self,
            EntryType::CleanerPayoutJob
                | EntryType::CleanerPayoutCancellation
                | EntryType::CleanerBonus
        )
    }

    pub fn tax_reportable(&self) -> bool {
        !matches!(self, EntryType::StripeFee | EntryType::ManualAdjustment)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    AccountsReceivable,
    Revenue,
    RefundsPayable,
    PayoutsPayable,
    PlatformRevenue,
    StripeFees,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::AccountsReceivable => "accounts_receivable",
            AccountType::Revenue => "revenue",
            AccountType::RefundsPayable => "refunds_payable",
            AccountType::PayoutsPayable => "payouts_payable",
            AccountType::PlatformRevenue => "platform_revenue",
            AccountType::StripeFees => "stripe_fees",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyType {
    Homeowner,
    Cleaner,
    Platform,
    Gateway,
}

impl PartyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyType::Homeowner => "homeowner",
            PartyType::Cleaner => "cleaner",
            PartyType::Platform => "platform",
            PartyType::Gateway => "gateway",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayObjectType {
    Charge,
    Refund,
    Transfer,
    Dispute,
}

impl GatewayObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayObjectType::Charge => "charge",
            GatewayObjectType::Refund => "refund",
            GatewayObjectType::Transfer => "transfer",
            GatewayObjectType::Dispute => "dispute",
        }
    }
}

/// Reference to the payment processor object that moved the money.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayObjectRef {
    pub object_type: GatewayObjectType,
    pub object_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxTags {
    pub tax_year: i32,
    pub tax_quarter: u8,
    pub tax_reportable: bool,
    pub form_1099_eligible: bool,
}

impl TaxTags {
    pub fn derive(entry_type: EntryType, effective_date: DateTime<Utc>) -> Self {
        Self {
            tax_year: effective_date.year(),
            tax_quarter: quarter_of(effective_date.month()),
            tax_reportable: entry_type.tax_reportable(),
            form_1099_eligible: entry_type.form_1099_eligible(),
        }
    }
}

pub fn quarter_of(month: u32) -> u8 {
    ((month - 1) / 3 + 1) as u8
}

/// Reconciliation annotation. The only attribute of an entry that changes after it
/// is posted, and never a financial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconciliationStatus {
    #[default]
    Unreconciled,
    Reconciled {
        at: DateTime<Utc>,
    },
    /// `amount` is gateway minus local, in cents.
    Discrepancy {
        amount: i64,
        gateway_amount: Option<Money>,
        detected_at: DateTime<Utc>,
    },
}

impl ReconciliationStatus {
    pub fn is_reconciled(&self) -> bool {
        matches!(self, ReconciliationStatus::Reconciled { .. })
    }

    pub fn discrepancy_amount(&self) -> Option<i64> {
        match self {
            ReconciliationStatus::Discrepancy { amount, .. } => Some(*amount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub description: String,
    pub rationale: Option<String>,
    pub reverses_entry_id: Option<Uuid>,
    pub appeal_id: Option<Uuid>,
    pub actor_id: Option<UserId>,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub appointment_id: AppointmentId,
    pub related_entry_id: Option<Uuid>,
    pub entry_type: EntryType,
    pub amount: Money,
    pub direction: Direction,
    pub account_type: AccountType,
    pub party_type: PartyType,
    pub party_user_id: Option<UserId>,
    pub gateway_object: Option<GatewayObjectRef>,
    pub idempotency_key: String,
    pub tax: TaxTags,
    pub reconciliation: ReconciliationStatus,
    pub effective_date: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    pub metadata: EntryMetadata,
}

/// One side of a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub account: AccountType,
    pub party_type: PartyType,
    pub party_user_id: Option<UserId>,
}

impl Leg {
    pub fn new(account: AccountType, party_type: PartyType, party_user_id: Option<UserId>) -> Self {
        Self {
            account,
            party_type,
            party_user_id,
        }
    }

    pub fn platform(account: AccountType) -> Self {
        Self::new(account, PartyType::Platform, None)
    }
}

/// What to post, before ids and timestamps are assigned.
#[derive(Debug, Clone)]
pub struct PairDraft {
    pub appointment_id: AppointmentId,
    pub entry_type: EntryType,
    pub amount: Money,
    pub debit: Leg,
    pub credit: Leg,
    pub gateway_object: Option<GatewayObjectRef>,
    pub idempotency_key: String,
    pub effective_date: DateTime<Utc>,
    pub metadata: EntryMetadata,
}

/// A balanced debit/credit pair, the only unit the ledger accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingPair {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

impl PostingPair {
    pub fn new(draft: PairDraft, posted_at: DateTime<Utc>) -> Self {
        let debit_id = Uuid::new_v4();
        let credit_id = Uuid::new_v4();
        let tax = TaxTags::derive(draft.entry_type, draft.effective_date);
        let entry = |id: Uuid, related: Uuid, direction: Direction, leg: Leg| LedgerEntry {
            id,
            appointment_id: draft.appointment_id,
            related_entry_id: Some(related),
            entry_type: draft.entry_type,
            amount: draft.amount,
            direction,
            account_type: leg.account,
            party_type: leg.party_type,
            party_user_id: leg.party_user_id,
            gateway_object: draft.gateway_object.clone(),
            idempotency_key: draft.idempotency_key.clone(),
            tax,
            reconciliation: ReconciliationStatus::Unreconciled,
            effective_date: draft.effective_date,
            posted_at,
            metadata: draft.metadata.clone(),
        };
        let debit = entry(debit_id, credit_id, Direction::Debit, draft.debit);
        let credit = entry(credit_id, debit_id, Direction::Credit, draft.credit);
        Self { debit, credit }
    }

    pub fn appointment_id(&self) -> AppointmentId {
        self.debit.appointment_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.debit.idempotency_key
    }

    pub fn amount(&self) -> Money {
        self.debit.amount
    }

    pub fn entry_type(&self) -> EntryType {
        self.debit.entry_type
    }

    pub fn entry_ids(&self) -> [Uuid; 2] {
        [self.debit.id, self.credit.id]
    }

    /// Secondary uniqueness key: one pair per gateway object, entry type and party.
    pub fn gateway_key(&self) -> Option<String> {
        self.debit.gateway_object.as_ref().map(|object| {
            let party = self
                .debit
                .party_user_id
                .or(self.credit.party_user_id)
                .map(|id| id.to_string())
                .unwrap_or_default();
            format!(
                "{}:{}:{}:{}",
                object.object_type.as_str(),
                object.object_id,
                self.debit.entry_type,
                party
            )
        })
    }

    /// Checks the pair is internally balanced and consistently linked.
    pub fn validate(&self) -> Result<()> {
        let violation = |detail: &str| LedgerError::LedgerInvariantViolation {
            appointment_id: self.debit.appointment_id,
            detail: detail.to_string(),
        };
        let (d, c) = (&self.debit, &self.credit);
        if d.direction != Direction::Debit || c.direction != Direction::Credit {
            return Err(violation("pair must hold one debit and one credit"));
        }
        if d.amount != c.amount {
            return Err(violation(&format!(
                "debit {} does not equal credit {}",
                d.amount, c.amount
            )));
        }
        if d.amount.is_zero() {
            return Err(violation("zero-amount postings are not recorded"));
        }
        if d.appointment_id != c.appointment_id {
            return Err(violation("pair spans two appointments"));
        }
        if d.entry_type != c.entry_type || d.idempotency_key != c.idempotency_key {
            return Err(violation("pair sides describe different events"));
        }
        if d.related_entry_id != Some(c.id) || c.related_entry_id != Some(d.id) {
            return Err(violation("pair sides are not cross-linked"));
        }
        Ok(())
    }
}

/// Debit and credit totals over a set of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub debits: Money,
    pub credits: Money,
    pub entry_count: usize,
}

impl LedgerTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        entries
            .into_iter()
            .fold(LedgerTotals::default(), |mut totals, entry| {
                match entry.direction {
                    Direction::Debit => totals.debits += entry.amount,
                    Direction::Credit => totals.credits += entry.amount,
                }
                totals.entry_count += 1;
                totals
            })
    }

    pub fn with_pair(mut self, pair: &PostingPair) -> Self {
        self.debits += pair.debit.amount;
        self.credits += pair.credit.amount;
        self.entry_count += 2;
        self
    }

    pub fn is_balanced(&self) -> bool {
        self.debits == self.credits
    }

    /// Validates `pair` and returns the appointment totals after posting it.
    ///
    /// Rejects the post if the pair is malformed or if the ledger it would land
    /// in is already out of balance.
    pub fn admit(self, pair: &PostingPair) -> Result<LedgerTotals> {
        pair.validate()?;
        if !self.is_balanced() {
            return Err(LedgerError::LedgerInvariantViolation {
                appointment_id: pair.appointment_id(),
                detail: format!(
                    "existing ledger is unbalanced (debits {}, credits {})",
                    self.debits, self.credits
                ),
            });
        }
        let after = self.with_pair(pair);
        if !after.is_balanced() {
            return Err(LedgerError::LedgerInvariantViolation {
                appointment_id: pair.appointment_id(),
                detail: "post would unbalance the ledger".to_string(),
            });
        }
        Ok(after)
    }
}

/// What the idempotency key of a posting is scoped to, beyond appointment and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    Booking,
    Settlement,
    Cleaner(UserId),
    Appeal(Uuid),
    AppealCleaner(Uuid, UserId),
    Gateway(String),
    Manual(Uuid),
}

pub fn idempotency_key(
    appointment_id: AppointmentId,
    entry_type: EntryType,
    scope: &KeyScope,
) -> String {
    let scope = match scope {
        KeyScope::Booking => "booking".to_string(),
        KeyScope::Settlement => "settlement".to_string(),
        KeyScope::Cleaner(id) => format!("cleaner-{id}"),
        KeyScope::Appeal(id) => format!("appeal-{id}"),
        KeyScope::AppealCleaner(appeal, cleaner) => format!("appeal-{appeal}-cleaner-{cleaner}"),
        KeyScope::Gateway(object_id) => format!("gw-{object_id}"),
        KeyScope::Manual(id) => format!("manual-{id}"),
    };
    format!("{appointment_id}:{entry_type}:{scope}")
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Inserted(PostingPair),
    /// The key (or gateway object) had already been posted; this is the original pair.
    Duplicate(PostingPair),
}

impl PostOutcome {
    pub fn pair(&self) -> &PostingPair {
        match self {
            PostOutcome::Inserted(pair) | PostOutcome::Duplicate(pair) => pair,
        }
    }

    pub fn into_pair(self) -> PostingPair {
        match self {
            PostOutcome::Inserted(pair) | PostOutcome::Duplicate(pair) => pair,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, PostOutcome::Duplicate(_))
    }
}

/// Why money is sitting in the operational queue instead of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PendingStage {
    /// Gateway retries ran out; nothing moved. Re-invoke the settlement.
    GatewayExhausted { operation: String, last_error: String },
    /// The gateway moved the money but the ledger write kept failing. The prepared
    /// pair carries the gateway reference and can be replayed without the gateway.
    LedgerWriteFailed { pair: Box<PostingPair>, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPosting {
    pub idempotency_key: String,
    pub appointment_id: AppointmentId,
    pub entry_type: EntryType,
    pub amount: Money,
    pub stage: PendingStage,
    pub recorded_at: DateTime<Utc>,
}
