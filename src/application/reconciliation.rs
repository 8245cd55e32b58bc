use super::audit::AuditLog;
use crate::domain::appeal::Actor;
use crate::domain::audit::{AuditEvent, AuditEventType, EventData};
use crate::domain::ledger::{
    Direction, EntryType, GatewayObjectRef, LedgerEntry, PartyType, ReconciliationStatus,
};
use crate::domain::money::Money;
use crate::domain::ports::{GatewayRef, LedgerStoreRef};
use crate::domain::reports::{
    PartyTaxLine, ReconciliationFinding, ReconciliationReport, ReconciliationRun, ReportPeriod,
    TaxReport, UnreconciledLine,
};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, instrument, warn};

/// Whether the entry is the money movement of its gateway object, as opposed to
/// a note attached to it (a processor fee on a charge, a won dispute).
fn moves_gateway_funds(entry_type: EntryType) -> bool {
    !matches!(
        entry_type,
        EntryType::StripeFee
            | EntryType::DisputeReversal
            | EntryType::PlatformFeeBooking
            | EntryType::PlatformFeeCancellation
            | EntryType::ManualAdjustment
    )
}

/// Compares the ledger with the processor's records. Only ever writes the
/// reconciliation annotation.
pub struct ReconciliationService {
    ledger: LedgerStoreRef,
    gateway: GatewayRef,
    audit: AuditLog,
}

impl ReconciliationService {
    pub fn new(ledger: LedgerStoreRef, gateway: GatewayRef, audit: AuditLog) -> Self {
        Self {
            ledger,
            gateway,
            audit,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconciliationRun> {
        let mut groups: HashMap<GatewayObjectRef, Vec<LedgerEntry>> = HashMap::new();
        let mut order = Vec::new();
        for entry in self.ledger.all_entries().await? {
            if let Some(object) = entry.gateway_object.clone() {
                let group = groups.entry(object.clone()).or_default();
                if group.is_empty() {
                    order.push(object);
                }
                group.push(entry);
            }
        }

        let mut run = ReconciliationRun::default();
        for object in order {
            let entries = &groups[&object];
            if entries.iter().all(|e| e.reconciliation.is_reconciled()) {
                continue;
            }
            run.objects_checked += 1;

            let gateway_amount = match self.gateway.retrieve(&object).await {
                Ok(receipt) => receipt.map(|r| r.amount),
                Err(err) => {
                    warn!(
                        object = %object.object_id,
                        error = %err,
                        "could not fetch gateway record"
                    );
                    run.errors += 1;
                    continue;
                }
            };
            let local_amount: Money = entries
                .iter()
                .filter(|e| e.direction == Direction::Debit && moves_gateway_funds(e.entry_type))
                .map(|e| e.amount)
                .sum();
            let discrepancy = gateway_amount
                .unwrap_or(Money::ZERO)
                .signed_diff(local_amount);
            let finding = ReconciliationFinding {
                object: object.clone(),
                appointment_id: entries[0].appointment_id,
                local_amount,
                gateway_amount,
                discrepancy,
            };

            let (status, event_type) = if finding.is_match() {
                run.matched += 1;
                (
                    ReconciliationStatus::Reconciled { at: now },
                    AuditEventType::ReconciliationMatched,
                )
            } else {
                run.discrepancies += 1;
                warn!(
                    object = %object.object_id,
                    local = %local_amount,
                    gateway = ?gateway_amount.map(|m| m.to_string()),
                    discrepancy,
                    "reconciliation discrepancy"
                );
                (
                    ReconciliationStatus::Discrepancy {
                        amount: discrepancy,
                        gateway_amount,
                        detected_at: now,
                    },
                    AuditEventType::ReconciliationDiscrepancy,
                )
            };
            for entry in entries.iter().filter(|e| !e.reconciliation.is_reconciled()) {
                self.ledger.mark_reconciliation(entry.id, status).await?;
            }
            self.audit
                .record(
                    AuditEvent::new(event_type, Actor::system(), now)
                        .appointment(finding.appointment_id)
                        .data(EventData::Reconciliation {
                            object: object.clone(),
                            local_amount,
                            gateway_amount,
                            discrepancy,
                            entry_ids: entries.iter().map(|e| e.id).collect(),
                        }),
                )
                .await?;
            run.findings.push(finding);
        }

        self.audit
            .record(
                AuditEvent::new(AuditEventType::ReconciliationRunCompleted, Actor::system(), now)
                    .data(EventData::ReconciliationRun {
                        objects_checked: run.objects_checked,
                        matched: run.matched,
                        discrepancies: run.discrepancies,
                    }),
            )
            .await?;
        info!(
            checked = run.objects_checked,
            matched = run.matched,
            discrepancies = run.discrepancies,
            "reconciliation run completed"
        );
        Ok(run)
    }

    pub async fn reconciliation_report(
        &self,
        period: ReportPeriod,
    ) -> Result<ReconciliationReport> {
        let entries: Vec<LedgerEntry> = self
            .ledger
            .all_entries()
            .await?
            .into_iter()
            .filter(|e| period.contains(e) && e.direction == Direction::Debit)
            .collect();

        let mut totals_by_type: BTreeMap<EntryType, Money> = BTreeMap::new();
        for entry in &entries {
            *totals_by_type.entry(entry.entry_type).or_default() += entry.amount;
        }
        let unreconciled = entries
            .into_iter()
            .filter(|e| !e.reconciliation.is_reconciled())
            .filter_map(|e| {
                let discrepancy = e.reconciliation.discrepancy_amount();
                e.gateway_object.map(|gateway_object| UnreconciledLine {
                    entry_id: e.id,
                    appointment_id: e.appointment_id,
                    entry_type: e.entry_type,
                    amount: e.amount,
                    gateway_object,
                    discrepancy,
                })
            })
            .collect();

        Ok(ReconciliationReport {
            period,
            totals_by_type,
            unreconciled,
        })
    }

    pub async fn tax_report(&self, year: i32, quarter: Option<u8>) -> Result<TaxReport> {
        if let Some(q) = quarter
            && !(1..=4).contains(&q)
        {
            return Err(LedgerError::ValidationError(format!(
                "quarter must be between 1 and 4, got {q}"
            )));
        }
        let period = ReportPeriod::TaxPeriod { year, quarter };
        let entries: Vec<LedgerEntry> = self
            .ledger
            .all_entries()
            .await?
            .into_iter()
            .filter(|e| {
                period.contains(e) && e.direction == Direction::Debit && e.tax.tax_reportable
            })
            .collect();

        let mut by_entry_type: BTreeMap<EntryType, Money> = BTreeMap::new();
        let mut payees: BTreeMap<u64, PartyTaxLine> = BTreeMap::new();
        for entry in &entries {
            *by_entry_type.entry(entry.entry_type).or_default() += entry.amount;
            if !entry.tax.form_1099_eligible || entry.party_type != PartyType::Cleaner {
                continue;
            }
            if let Some(user) = entry.party_user_id {
                let line = payees.entry(user.0).or_insert(PartyTaxLine {
                    party_type: entry.party_type,
                    party_user_id: user,
                    total: Money::ZERO,
                    entry_count: 0,
                });
                line.total += entry.amount;
                line.entry_count += 1;
            }
        }

        Ok(TaxReport {
            year,
            quarter,
            parties: payees.into_values().collect(),
            by_entry_type,
        })
    }
}
