//! Appeal lifecycle: submission, review, resolution and closure.
//!
//! Transitions are serialized per appeal and validated before anything is
//! persisted. Approvals settle their relief first; if that fails the stored
//! appeal is left exactly as it was.

use super::audit::AuditLog;
use super::locks::KeyedLocks;
use super::policy;
use super::settlement::{SettlementOrchestrator, is_cancellation_settlement};
use crate::config::AppealConfig;
use crate::domain::appeal::{
    Actor, Appeal, AppealRequest, AppealStatus, AppealerType, Decision, EscalationReason,
    Priority, Resolution, SupportingDocument,
};
use crate::domain::appointment::Appointment;
use crate::domain::audit::{AuditEvent, AuditEventType, StateSnapshot};
use crate::domain::ledger::{Direction, EntryType};
use crate::domain::money::Money;
use crate::domain::ports::{AppealStoreRef, LedgerStoreRef};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct AppealWorkflow {
    appeals: AppealStoreRef,
    ledger: LedgerStoreRef,
    settlement: Arc<SettlementOrchestrator>,
    audit: AuditLog,
    config: AppealConfig,
    locks: KeyedLocks<Uuid>,
}

impl AppealWorkflow {
    pub fn new(
        appeals: AppealStoreRef,
        ledger: LedgerStoreRef,
        settlement: Arc<SettlementOrchestrator>,
        audit: AuditLog,
        config: AppealConfig,
    ) -> Self {
        Self {
            appeals,
            ledger,
            settlement,
            audit,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Files an appeal against a settled cancellation.
    #[instrument(skip(self, request, appointment), fields(appointment_id = %appointment.id))]
    pub async fn submit(
        &self,
        request: AppealRequest,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        if request.appointment_id != appointment.id {
            return Err(LedgerError::ValidationError(
                "appeal does not match the appointment".to_string(),
            ));
        }
        if request.description.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "an appeal needs a description".to_string(),
            ));
        }
        if request.contesting_items.is_empty() {
            return Err(LedgerError::ValidationError(
                "an appeal must contest at least one item".to_string(),
            ));
        }
        let is_party = match request.appealer_type {
            AppealerType::Homeowner => request.appealer_id == appointment.homeowner_id,
            AppealerType::Cleaner => appointment.is_assigned_cleaner(request.appealer_id),
        };
        if !is_party {
            return Err(LedgerError::Unauthorized(format!(
                "user {} is not a party to appointment {}",
                request.appealer_id, appointment.id
            )));
        }

        let already_open = self.appeals.get_all().await?.into_iter().any(|a| {
            a.appointment_id == appointment.id
                && a.appealer_id == request.appealer_id
                && a.status.is_active()
        });
        if already_open {
            return Err(LedgerError::ValidationError(format!(
                "user {} already has an open appeal on appointment {}",
                request.appealer_id, appointment.id
            )));
        }

        let entries = self.ledger.entries_for_appointment(appointment.id).await?;
        let cancelled_at = entries
            .iter()
            .filter(|e| is_cancellation_settlement(e))
            .map(|e| e.effective_date)
            .min()
            .ok_or_else(|| {
                LedgerError::ValidationError(format!(
                    "appointment {} has no settled cancellation",
                    appointment.id
                ))
            })?;
        let window = Duration::hours(self.settlement.policy().appeal_window_hours);
        if now > cancelled_at + window {
            return Err(LedgerError::ValidationError(
                "the appeal window has closed".to_string(),
            ));
        }

        let debit_sum = |pred: fn(EntryType) -> bool| -> Money {
            entries
                .iter()
                .filter(|e| e.direction == Direction::Debit && pred(e.entry_type))
                .map(|e| e.amount)
                .sum()
        };
        let (original_penalty_amount, original_refund_withheld) = match request.appealer_type {
            AppealerType::Homeowner => {
                let fees = debit_sum(|t| t == EntryType::CancellationFeeRevenue);
                let charged = debit_sum(|t| t.is_booking_charge());
                let refunded = debit_sum(|t| t.is_refund());
                (fees, charged.saturating_sub(refunded))
            }
            AppealerType::Cleaner => {
                let forfeited = policy::job_payout_shares(self.settlement.policy(), appointment)?
                    .into_iter()
                    .find(|s| s.cleaner_id == request.appealer_id)
                    .map(|s| s.amount)
                    .unwrap_or(Money::ZERO);
                (forfeited, Money::ZERO)
            }
        };

        let priority = Priority::from_category(request.category, request.severity);
        let appeal = Appeal {
            id: Uuid::new_v4(),
            appointment_id: appointment.id,
            appealer_id: request.appealer_id,
            appealer_type: request.appealer_type,
            category: request.category,
            severity: request.severity,
            description: request.description,
            supporting_documents: request.supporting_documents,
            contesting_items: request.contesting_items,
            original_penalty_amount,
            original_refund_withheld,
            requested_relief: request.requested_relief,
            status: AppealStatus::Submitted,
            priority,
            submitted_at: now,
            sla_deadline: now + Duration::hours(self.config.sla_hours(priority)),
            assigned_to: None,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            escalation_reason: None,
            resolution: None,
            relief_settled: false,
            closed_at: None,
        };

        self.appeals.store(appeal.clone()).await?;
        let actor = match appeal.appealer_type {
            AppealerType::Homeowner => Actor::homeowner(appeal.appealer_id),
            AppealerType::Cleaner => Actor::cleaner(appeal.appealer_id),
        };
        self.audit
            .record(
                AuditEvent::new(AuditEventType::AppealSubmitted, actor, now)
                    .appointment(appeal.appointment_id)
                    .appeal(appeal.id)
                    .states(None, Some(StateSnapshot::Appeal(Box::new(appeal.clone())))),
            )
            .await?;
        info!(
            appeal_id = %appeal.id,
            priority = ?appeal.priority,
            sla_deadline = %appeal.sla_deadline,
            "appeal submitted"
        );
        Ok(appeal)
    }

    /// The appealer (or staff) attaches evidence. Does not change the status.
    #[instrument(skip(self, documents, actor))]
    pub async fn add_documents(
        &self,
        appeal_id: Uuid,
        documents: Vec<SupportingDocument>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        let _guard = self.locks.lock(appeal_id).await;
        let before = self.load(appeal_id).await?;
        if actor.id != Some(before.appealer_id) && !actor.role.is_staff() {
            return Err(LedgerError::Unauthorized(
                "only the appealer or staff may add documents".to_string(),
            ));
        }
        if before.status == AppealStatus::Closed {
            return Err(LedgerError::ValidationError("appeal is closed".to_string()));
        }
        if documents.is_empty() {
            return Err(LedgerError::ValidationError("no documents given".to_string()));
        }
        let mut after = before.clone();
        after.supporting_documents.extend(documents);
        self.commit(before, after, AuditEventType::AppealDocumentsAdded, actor, now)
            .await
    }

    /// Staff picks the appeal up, or resumes it once documents arrived.
    #[instrument(skip(self, actor))]
    pub async fn start_review(
        &self,
        appeal_id: Uuid,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        let _guard = self.locks.lock(appeal_id).await;
        let before = self.load(appeal_id).await?;
        before.check_transition(AppealStatus::UnderReview, &actor, None, now)?;
        let mut after = before.clone();
        after.status = AppealStatus::UnderReview;
        if after.assigned_to.is_none() {
            after.assigned_to = actor.id;
        }
        self.commit(before, after, AuditEventType::AppealStatusChanged, actor, now)
            .await
    }

    #[instrument(skip(self, notes, actor))]
    pub async fn request_documents(
        &self,
        appeal_id: Uuid,
        notes: String,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        let _guard = self.locks.lock(appeal_id).await;
        let before = self.load(appeal_id).await?;
        before.check_transition(AppealStatus::AwaitingDocuments, &actor, None, now)?;
        let mut after = before.clone();
        after.status = AppealStatus::AwaitingDocuments;
        after.review_notes = Some(notes);
        self.commit(before, after, AuditEventType::AppealStatusChanged, actor, now)
            .await
    }

    /// Applies a review decision.
    ///
    /// Approvals move their money first; the status is only persisted once the
    /// relief is fully settled.
    #[instrument(skip(self, decision, notes, actor))]
    pub async fn resolve(
        &self,
        appeal_id: Uuid,
        decision: Decision,
        notes: Option<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        let _guard = self.locks.lock(appeal_id).await;
        let before = self.load(appeal_id).await?;
        let notes = notes.filter(|n| !n.trim().is_empty());
        let target = decision.target();
        let escalation = match &decision {
            Decision::Escalate { reason } => Some(reason),
            _ => None,
        };
        before.check_transition(target, &actor, escalation, now)?;

        let mut after = before.clone();
        after.status = target;
        let event_type = match decision {
            Decision::Approve { resolution } | Decision::PartiallyApprove { resolution } => {
                if resolution.is_empty() {
                    return Err(LedgerError::ValidationError(
                        "an approval needs a non-empty resolution".to_string(),
                    ));
                }
                let summary = self
                    .settlement
                    .settle_appeal_relief(&before, &resolution, actor, now)
                    .await?;
                info!(%appeal_id, relief = %summary.total(), "appeal relief settled");
                after.resolution = Some(Resolution {
                    notes: resolution.notes.clone().or_else(|| notes.clone()),
                    ..resolution
                });
                after.relief_settled = true;
                self.mark_reviewed(&mut after, actor, notes, now);
                AuditEventType::AppealResolved
            }
            Decision::Deny => {
                if notes.is_none() {
                    return Err(LedgerError::ValidationError(
                        "a denial needs review notes".to_string(),
                    ));
                }
                self.mark_reviewed(&mut after, actor, notes, now);
                AuditEventType::AppealResolved
            }
            Decision::Escalate { reason } => {
                if let EscalationReason::ReviewerRequest(text) = &reason
                    && text.trim().is_empty()
                {
                    return Err(LedgerError::ValidationError(
                        "an escalation needs a reason".to_string(),
                    ));
                }
                after.escalation_reason = Some(reason);
                if notes.is_some() {
                    after.review_notes = notes;
                }
                AuditEventType::AppealEscalated
            }
        };
        self.commit(before, after, event_type, actor, now).await
    }

    pub async fn escalate(
        &self,
        appeal_id: Uuid,
        reason: EscalationReason,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        self.resolve(appeal_id, Decision::Escalate { reason }, None, actor, now)
            .await
    }

    #[instrument(skip(self, actor))]
    pub async fn close(&self, appeal_id: Uuid, actor: Actor, now: DateTime<Utc>) -> Result<Appeal> {
        let _guard = self.locks.lock(appeal_id).await;
        let before = self.load(appeal_id).await?;
        before.check_transition(AppealStatus::Closed, &actor, None, now)?;
        let mut after = before.clone();
        after.status = AppealStatus::Closed;
        after.closed_at = Some(now);
        self.commit(before, after, AuditEventType::AppealClosed, actor, now)
            .await
    }

    pub async fn get(&self, appeal_id: Uuid) -> Result<Appeal> {
        self.load(appeal_id).await
    }

    pub async fn list(&self) -> Result<Vec<Appeal>> {
        self.appeals.get_all().await
    }

    /// Active appeals past their SLA deadline.
    pub async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<Appeal>> {
        Ok(self
            .appeals
            .get_all()
            .await?
            .into_iter()
            .filter(|a| a.is_overdue(now))
            .collect())
    }

    /// Escalates every overdue appeal as the system actor.
    #[instrument(skip(self))]
    pub async fn escalate_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Appeal>> {
        let mut escalated = Vec::new();
        for appeal in self.overdue(now).await? {
            match self
                .escalate(appeal.id, EscalationReason::SlaBreach, Actor::system(), now)
                .await
            {
                Ok(a) => escalated.push(a),
                // Picked up by a reviewer in the meantime.
                Err(LedgerError::InvalidAppealTransition { reason, .. }) => {
                    warn!(appeal_id = %appeal.id, %reason, "skipped automatic escalation");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(escalated)
    }

    fn mark_reviewed(
        &self,
        appeal: &mut Appeal,
        actor: Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) {
        appeal.reviewed_by = actor.id;
        appeal.reviewed_at = Some(now);
        if notes.is_some() {
            appeal.review_notes = notes;
        }
    }

    async fn load(&self, appeal_id: Uuid) -> Result<Appeal> {
        self.appeals
            .get(appeal_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("appeal {appeal_id}")))
    }

    async fn commit(
        &self,
        before: Appeal,
        after: Appeal,
        event_type: AuditEventType,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Appeal> {
        self.appeals.store(after.clone()).await?;
        info!(appeal_id = %after.id, from = %before.status, to = %after.status, "appeal updated");
        self.audit
            .record(
                AuditEvent::new(event_type, actor, now)
                    .appointment(after.appointment_id)
                    .appeal(after.id)
                    .states(
                        Some(StateSnapshot::Appeal(Box::new(before))),
                        Some(StateSnapshot::Appeal(Box::new(after.clone()))),
                    ),
            )
            .await?;
        Ok(after)
    }
}
