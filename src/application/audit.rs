use crate::domain::appeal::Appeal;
use crate::domain::audit::{AuditEvent, StateSnapshot};
use crate::domain::ids::AppointmentId;
use crate::domain::ledger::LedgerTotals;
use crate::domain::ports::AuditStoreRef;
use crate::error::Result;
use tracing::{error, info};
use uuid::Uuid;

/// Append-only audit trail shared by every service.
#[derive(Clone)]
pub struct AuditLog {
    store: AuditStoreRef,
}

impl AuditLog {
    pub fn new(store: AuditStoreRef) -> Self {
        Self { store }
    }

    /// Appends `event` and mirrors it to the tracing output. Critical events
    /// are logged at error level so they reach an operator.
    pub async fn record(&self, event: AuditEvent) -> Result<()> {
        if event.event_type.is_critical() {
            error!(
                event_type = %event.event_type,
                appointment_id = ?event.appointment_id,
                appeal_id = ?event.appeal_id,
                request_id = ?event.request_id,
                "critical audit event"
            );
        } else {
            info!(
                event_type = %event.event_type,
                appointment_id = ?event.appointment_id,
                appeal_id = ?event.appeal_id,
                "audit event"
            );
        }
        self.store.append(event).await
    }

    pub async fn events(&self) -> Result<Vec<AuditEvent>> {
        self.store.get_all().await
    }

    pub async fn events_for_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Vec<AuditEvent>> {
        Ok(self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|e| e.appointment_id == Some(appointment_id))
            .collect())
    }

    pub async fn events_for_appeal(&self, appeal_id: Uuid) -> Result<Vec<AuditEvent>> {
        Ok(self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|e| e.appeal_id == Some(appeal_id))
            .collect())
    }

    /// Rebuilds an appeal from its audit history alone.
    pub async fn reconstruct_appeal(&self, appeal_id: Uuid) -> Result<Option<Appeal>> {
        let events = self.events_for_appeal(appeal_id).await?;
        Ok(events.into_iter().fold(None, |state, event| match event.new_state {
            Some(StateSnapshot::Appeal(appeal)) => Some(*appeal),
            _ => state,
        }))
    }

    /// Ledger totals of an appointment as last recorded by the audit trail.
    pub async fn reconstruct_ledger_totals(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<LedgerTotals> {
        let events = self.events_for_appointment(appointment_id).await?;
        Ok(events
            .into_iter()
            .fold(LedgerTotals::default(), |totals, event| match event.new_state {
                Some(StateSnapshot::LedgerTotals(t)) => t,
                _ => totals,
            }))
    }
}
