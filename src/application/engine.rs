use super::appeals::AppealWorkflow;
use super::audit::AuditLog;
use super::reconciliation::ReconciliationService;
use super::settlement::SettlementOrchestrator;
use crate::config::AppConfig;
use crate::domain::appointment::{Appointment, CancelledBy};
use crate::domain::ids::AppointmentId;
use crate::domain::ledger::{LedgerEntry, LedgerTotals};
use crate::domain::ports::{AppealStoreRef, AuditStoreRef, GatewayRef, LedgerStoreRef};
use crate::domain::settlement::Breakdown;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cancellation as it arrives from the scheduling system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRequest {
    pub appointment: Appointment,
    pub cancelled_by: CancelledBy,
    pub booked_at: DateTime<Utc>,
    pub cancelled_at: DateTime<Utc>,
}

/// The main entry point of the settlement and ledger engine.
///
/// `LedgerEngine` owns the storage backends and the gateway, and wires the
/// services that share them.
pub struct LedgerEngine {
    ledger: LedgerStoreRef,
    audit: AuditLog,
    settlement: Arc<SettlementOrchestrator>,
    appeals: AppealWorkflow,
    reconciliation: ReconciliationService,
}

impl LedgerEngine {
    pub fn new(
        config: AppConfig,
        ledger: LedgerStoreRef,
        appeals: AppealStoreRef,
        audit: AuditStoreRef,
        gateway: GatewayRef,
    ) -> Self {
        let audit = AuditLog::new(audit);
        let settlement = Arc::new(SettlementOrchestrator::new(
            ledger.clone(),
            gateway.clone(),
            audit.clone(),
            config.policy,
            config.retry,
        ));
        let appeals = AppealWorkflow::new(
            appeals,
            ledger.clone(),
            settlement.clone(),
            audit.clone(),
            config.appeals,
        );
        let reconciliation = ReconciliationService::new(ledger.clone(), gateway, audit.clone());
        Self {
            ledger,
            audit,
            settlement,
            appeals,
            reconciliation,
        }
    }

    pub fn settlement(&self) -> &SettlementOrchestrator {
        &self.settlement
    }

    pub fn appeals(&self) -> &AppealWorkflow {
        &self.appeals
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Makes sure the booking was captured, then settles the cancellation.
    pub async fn process_cancellation(&self, request: &CancellationRequest) -> Result<Breakdown> {
        self.settlement
            .charge_booking(&request.appointment, request.booked_at)
            .await?;
        self.settlement
            .settle_cancellation(&request.appointment, request.cancelled_by, request.cancelled_at)
            .await
    }

    pub async fn entries(&self, appointment_id: Option<AppointmentId>) -> Result<Vec<LedgerEntry>> {
        match appointment_id {
            Some(id) => self.ledger.entries_for_appointment(id).await,
            None => self.ledger.all_entries().await,
        }
    }

    pub async fn totals(&self, appointment_id: AppointmentId) -> Result<LedgerTotals> {
        Ok(LedgerTotals::from_entries(
            &self.ledger.entries_for_appointment(appointment_id).await?,
        ))
    }

    /// Debit/credit totals of every appointment that is out of balance.
    pub async fn unbalanced_appointments(&self) -> Result<BTreeMap<AppointmentId, LedgerTotals>> {
        let mut by_appointment: BTreeMap<AppointmentId, Vec<LedgerEntry>> = BTreeMap::new();
        for entry in self.ledger.all_entries().await? {
            by_appointment.entry(entry.appointment_id).or_default().push(entry);
        }
        Ok(by_appointment
            .into_iter()
            .map(|(id, entries)| (id, LedgerTotals::from_entries(&entries)))
            .filter(|(_, totals)| !totals.is_balanced())
            .collect())
    }
}
