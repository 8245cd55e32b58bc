use super::ids::{AppointmentId, UserId};
use super::ledger::{EntryType, GatewayObjectRef, LedgerEntry, PartyType};
use super::money::Money;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportPeriod {
    /// Inclusive on both ends, by effective date.
    DateRange { from: NaiveDate, to: NaiveDate },
    TaxPeriod { year: i32, quarter: Option<u8> },
}

impl ReportPeriod {
    pub fn contains(&self, entry: &LedgerEntry) -> bool {
        match self {
            ReportPeriod::DateRange { from, to } => {
                let date = entry.effective_date.date_naive();
                *from <= date && date <= *to
            }
            ReportPeriod::TaxPeriod { year, quarter } => {
                entry.tax.tax_year == *year && quarter.is_none_or(|q| q == entry.tax.tax_quarter)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFinding {
    pub object: GatewayObjectRef,
    pub appointment_id: AppointmentId,
    pub local_amount: Money,
    /// `None` when the processor has no record of the object.
    pub gateway_amount: Option<Money>,
    /// gateway - local, in cents. Zero for a match.
    pub discrepancy: i64,
}

impl ReconciliationFinding {
    pub fn is_match(&self) -> bool {
        self.gateway_amount == Some(self.local_amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub objects_checked: usize,
    pub matched: usize,
    pub discrepancies: usize,
    /// Objects skipped because the processor could not be reached.
    pub errors: usize,
    pub findings: Vec<ReconciliationFinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreconciledLine {
    pub entry_id: Uuid,
    pub appointment_id: AppointmentId,
    pub entry_type: EntryType,
    pub amount: Money,
    pub gateway_object: GatewayObjectRef,
    pub discrepancy: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub period: ReportPeriod,
    /// Debit-side totals.
    pub totals_by_type: BTreeMap<EntryType, Money>,
    pub unreconciled: Vec<UnreconciledLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyTaxLine {
    pub party_type: PartyType,
    pub party_user_id: UserId,
    pub total: Money,
    pub entry_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxReport {
    pub year: i32,
    pub quarter: Option<u8>,
    /// 1099-eligible totals per payee, ordered by party.
    pub parties: Vec<PartyTaxLine>,
    /// Tax-reportable totals per entry type.
    pub by_entry_type: BTreeMap<EntryType, Money>,
}
