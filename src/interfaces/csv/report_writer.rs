use crate::domain::ledger::LedgerEntry;
use crate::domain::reports::{ReconciliationReport, TaxReport};
use crate::domain::settlement::{Breakdown, CancellationWindow};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BreakdownRow<'a> {
    confirmation_id: &'a str,
    appointment_id: u64,
    days_until: i64,
    window: &'static str,
    total_charged: String,
    refund: String,
    refund_percentage: String,
    cancellation_fee: String,
    cleaner_payout: String,
    platform_revenue: String,
    net_cost: String,
    appeal_deadline: String,
}

impl<'a> From<&'a Breakdown> for BreakdownRow<'a> {
    fn from(b: &'a Breakdown) -> Self {
        Self {
            confirmation_id: &b.confirmation_id,
            appointment_id: b.appointment_id.0,
            days_until: b.days_until,
            window: match b.window {
                CancellationWindow::Lenient => "lenient",
                CancellationWindow::Penalty => "penalty",
            },
            total_charged: b.net_cost.total_charged.to_string(),
            refund: b.refund.amount.to_string(),
            refund_percentage: b.refund.percentage.normalize().to_string(),
            cancellation_fee: b.cancellation_fee.amount.to_string(),
            cleaner_payout: b.cleaner_compensation.total.to_string(),
            platform_revenue: b.platform.total.to_string(),
            net_cost: b.net_cost.net_cost.to_string(),
            appeal_deadline: b.appeal.deadline.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct EntryRow<'a> {
    entry_id: String,
    appointment_id: u64,
    entry_type: &'static str,
    direction: &'static str,
    account: &'static str,
    party: &'static str,
    party_user_id: Option<u64>,
    amount: String,
    gateway_object: Option<&'a str>,
    idempotency_key: &'a str,
    reconciliation: &'static str,
    effective_date: String,
}

impl<'a> From<&'a LedgerEntry> for EntryRow<'a> {
    fn from(e: &'a LedgerEntry) -> Self {
        use crate::domain::ledger::{Direction, ReconciliationStatus};
        Self {
            entry_id: e.id.to_string(),
            appointment_id: e.appointment_id.0,
            entry_type: e.entry_type.as_str(),
            direction: match e.direction {
                Direction::Debit => "debit",
                Direction::Credit => "credit",
            },
            account: e.account_type.as_str(),
            party: e.party_type.as_str(),
            party_user_id: e.party_user_id.map(|id| id.0),
            amount: e.amount.to_string(),
            gateway_object: e.gateway_object.as_ref().map(|o| o.object_id.as_str()),
            idempotency_key: &e.idempotency_key,
            reconciliation: match e.reconciliation {
                ReconciliationStatus::Unreconciled => "unreconciled",
                ReconciliationStatus::Reconciled { .. } => "reconciled",
                ReconciliationStatus::Discrepancy { .. } => "discrepancy",
            },
            effective_date: e.effective_date.to_rfc3339(),
        }
    }
}

/// Shared row layout of the two report kinds: a `section` column tells totals
/// apart from detail lines.
#[derive(Serialize)]
struct ReportRow {
    section: &'static str,
    key: String,
    appointment_id: Option<u64>,
    amount: String,
    count: Option<usize>,
    gateway_object: Option<String>,
    discrepancy: Option<i64>,
}

/// Writes engine output as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_breakdowns<'a>(
        &mut self,
        breakdowns: impl IntoIterator<Item = &'a Breakdown>,
    ) -> Result<()> {
        for breakdown in breakdowns {
            self.writer.serialize(BreakdownRow::from(breakdown))?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_entries<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<()> {
        for entry in entries {
            self.writer.serialize(EntryRow::from(entry))?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_reconciliation_report(&mut self, report: &ReconciliationReport) -> Result<()> {
        for (entry_type, total) in &report.totals_by_type {
            self.writer.serialize(ReportRow {
                section: "total",
                key: entry_type.to_string(),
                appointment_id: None,
                amount: total.to_string(),
                count: None,
                gateway_object: None,
                discrepancy: None,
            })?;
        }
        for line in &report.unreconciled {
            self.writer.serialize(ReportRow {
                section: "unreconciled",
                key: line.entry_type.to_string(),
                appointment_id: Some(line.appointment_id.0),
                amount: line.amount.to_string(),
                count: None,
                gateway_object: Some(line.gateway_object.object_id.clone()),
                discrepancy: line.discrepancy,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_tax_report(&mut self, report: &TaxReport) -> Result<()> {
        for party in &report.parties {
            self.writer.serialize(ReportRow {
                section: "payee",
                key: format!("{}:{}", party.party_type.as_str(), party.party_user_id),
                appointment_id: None,
                amount: party.total.to_string(),
                count: Some(party.entry_count),
                gateway_object: None,
                discrepancy: None,
            })?;
        }
        for (entry_type, total) in &report.by_entry_type {
            self.writer.serialize(ReportRow {
                section: "entry_type",
                key: entry_type.to_string(),
                appointment_id: None,
                amount: total.to_string(),
                count: None,
                gateway_object: None,
                discrepancy: None,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
