//! Moves money through the gateway and records every movement in the ledger.
//!
//! Each step of a settlement is one gateway call followed by one posting pair,
//! both keyed by the same deterministic idempotency key. Re-invoking a settlement
//! after a partial failure skips the steps already recorded and continues with
//! the rest, so no party is ever charged, refunded or paid twice.

use super::audit::AuditLog;
use super::locks::KeyedLocks;
use super::policy;
use crate::config::{PolicyConfig, RetryConfig};
use crate::domain::appeal::{Actor, Appeal, AppealerType, Resolution};
use crate::domain::appointment::{Appointment, CancelledBy};
use crate::domain::audit::{AuditEvent, AuditEventType, EventData, StateSnapshot};
use crate::domain::gateway::{
    GatewayOperation, GatewayReceipt, GatewayRequest, WebhookEvent, WebhookKind,
};
use crate::domain::ids::{AppointmentId, UserId};
use crate::domain::ledger::{
    Direction, EntryMetadata, EntryType, GatewayObjectRef, KeyScope, Leg, LedgerEntry,
    LedgerTotals, PairDraft, PartyType, PendingPosting, PendingStage, PostOutcome, PostingPair,
    idempotency_key,
};
use crate::domain::money::Money;
use crate::domain::ports::{GatewayRef, LedgerStoreRef};
use crate::domain::settlement::{
    AppealEligibility, Breakdown, CancellationOutcome, CleanerCompensation, CleanerPayoutLine,
    FeeDetails, FeeStatus, ManualAdjustment, NetCostSummary, OriginalCharges, PlatformSummary,
    RefundDetails, ReliefSummary, ReplayReport,
};
use crate::error::{LedgerError, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type Party = (PartyType, Option<UserId>);

const PLATFORM: Party = (PartyType::Platform, None);

fn homeowner(id: UserId) -> Party {
    (PartyType::Homeowner, Some(id))
}

fn cleaner(id: UserId) -> Party {
    (PartyType::Cleaner, Some(id))
}

/// State shared by every step of one orchestrator call.
struct Operation {
    request_id: Uuid,
    actor: Actor,
    appointment_id: AppointmentId,
    appeal_id: Option<Uuid>,
    now: DateTime<Utc>,
    /// Effective date stamped on the entries this operation posts.
    effective: DateTime<Utc>,
    /// Gateway steps that moved money, including ones done by an earlier attempt.
    completed_steps: usize,
}

impl Operation {
    fn new(appointment_id: AppointmentId, actor: Actor, now: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            actor,
            appointment_id,
            appeal_id: None,
            now,
            effective: now,
            completed_steps: 0,
        }
    }

    fn event(&self, event_type: AuditEventType) -> AuditEvent {
        let event = AuditEvent::new(event_type, self.actor, self.now)
            .appointment(self.appointment_id)
            .request(self.request_id);
        match self.appeal_id {
            Some(id) => event.appeal(id),
            None => event,
        }
    }

    fn draft(
        &self,
        entry_type: EntryType,
        amount: Money,
        scope: &KeyScope,
        (debit, credit): (Party, Party),
        description: String,
    ) -> Result<PairDraft> {
        let (debit_account, credit_account) = entry_type.standard_accounts().ok_or_else(|| {
            LedgerError::internal(format!("{entry_type} has no standard accounts"))
        })?;
        Ok(PairDraft {
            appointment_id: self.appointment_id,
            entry_type,
            amount,
            debit: Leg::new(debit_account, debit.0, debit.1),
            credit: Leg::new(credit_account, credit.0, credit.1),
            gateway_object: None,
            idempotency_key: idempotency_key(self.appointment_id, entry_type, scope),
            effective_date: self.effective,
            metadata: EntryMetadata {
                description,
                appeal_id: self.appeal_id,
                actor_id: self.actor.id,
                request_id: Some(self.request_id),
                ..Default::default()
            },
        })
    }
}

/// A money-moving gateway call and the audit events that describe its outcome.
struct GatewayStep {
    request: GatewayRequest,
    /// Entry type the step will be recorded as.
    entry_type: EntryType,
    succeeded: AuditEventType,
    failed: AuditEventType,
}

fn receipt_of(pair: &PostingPair) -> Option<GatewayReceipt> {
    pair.debit.gateway_object.clone().map(|object| GatewayReceipt {
        object,
        amount: pair.amount(),
        created_at: pair.debit.effective_date,
    })
}

fn debits(entries: &[LedgerEntry]) -> impl Iterator<Item = &LedgerEntry> {
    entries.iter().filter(|e| e.direction == Direction::Debit)
}

fn booking_charge(entries: &[LedgerEntry]) -> Option<GatewayObjectRef> {
    debits(entries)
        .find(|e| e.entry_type == EntryType::BookingRevenue)
        .and_then(|e| e.gateway_object.clone())
}

fn booking_homeowner(entries: &[LedgerEntry]) -> Option<UserId> {
    debits(entries)
        .find(|e| e.entry_type == EntryType::BookingRevenue)
        .and_then(|e| e.party_user_id)
}

fn is_job_payout(entry: &LedgerEntry) -> bool {
    matches!(entry.entry_type, EntryType::CleanerPayoutJob | EntryType::PlatformFeeBooking)
}

/// Entries written by the cancellation settlement itself, as opposed to appeal relief.
pub(crate) fn is_cancellation_settlement(entry: &LedgerEntry) -> bool {
    matches!(
        entry.entry_type,
        EntryType::CancellationRefund
            | EntryType::CancellationPartialRefund
            | EntryType::CancellationFeeRevenue
            | EntryType::CleanerPayoutCancellation
            | EntryType::PlatformFeeCancellation
    ) && entry.metadata.appeal_id.is_none()
}

/// `CXL-YYYYMMDD-XXXXXX`, stable for a given appointment and cancellation date.
pub fn confirmation_id(appointment_id: AppointmentId, cancelled_on: NaiveDate) -> String {
    let digest = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("cancellation:{appointment_id}").as_bytes(),
    )
    .simple()
    .to_string();
    format!(
        "CXL-{}-{}",
        cancelled_on.format("%Y%m%d"),
        digest[..6].to_uppercase()
    )
}

pub struct SettlementOrchestrator {
    ledger: LedgerStoreRef,
    gateway: GatewayRef,
    audit: AuditLog,
    policy: PolicyConfig,
    retry: RetryConfig,
    locks: KeyedLocks<AppointmentId>,
}

impl SettlementOrchestrator {
    pub fn new(
        ledger: LedgerStoreRef,
        gateway: GatewayRef,
        audit: AuditLog,
        policy: PolicyConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            audit,
            policy,
            retry,
            locks: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Captures the booking charge and records one pair per line item.
    #[instrument(skip(self, appointment), fields(appointment_id = %appointment.id))]
    pub async fn charge_booking(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<GatewayReceipt> {
        let _guard = self.locks.lock(appointment.id).await;
        let actor = Actor::homeowner(appointment.homeowner_id);
        let mut op = Operation::new(appointment.id, actor, now);
        if appointment.base_price.is_zero() {
            return Err(LedgerError::PolicyComputation(format!(
                "appointment {} has no base price",
                appointment.id
            )));
        }
        let total = appointment.checked_total_charge().ok_or_else(|| {
            LedgerError::PolicyComputation(format!(
                "appointment {} charges overflow the amount range",
                appointment.id
            ))
        })?;

        let key = idempotency_key(appointment.id, EntryType::BookingRevenue, &KeyScope::Booking);
        let receipt = match self.already_posted(&mut op, &key).await? {
            Some(pair) => receipt_of(&pair).ok_or_else(|| {
                LedgerError::internal(format!("booking pair {key} has no gateway reference"))
            })?,
            None => {
                let step = GatewayStep {
                    request: GatewayRequest {
                        operation: GatewayOperation::Capture,
                        idempotency_key: key,
                        amount: total,
                        appointment_id: appointment.id,
                        party_user_id: Some(appointment.homeowner_id),
                        source: None,
                        description: format!("Cleaning appointment {}", appointment.id),
                    },
                    entry_type: EntryType::BookingRevenue,
                    succeeded: AuditEventType::BookingChargeSucceeded,
                    failed: AuditEventType::BookingChargeFailed,
                };
                self.call_gateway(&mut op, &step).await?
            }
        };

        for item in appointment.line_items() {
            let draft = op.draft(
                item.entry_type,
                item.amount,
                &KeyScope::Booking,
                (homeowner(appointment.homeowner_id), PLATFORM),
                item.label.clone(),
            )?;
            let pair = PostingPair::new(
                PairDraft {
                    gateway_object: Some(receipt.object.clone()),
                    ..draft
                },
                Utc::now(),
            );
            self.post(&mut op, pair).await?;
        }

        info!(charge = %receipt.object.object_id, amount = %receipt.amount, "booking charged");
        Ok(receipt)
    }

    /// Applies the cancellation policy and settles every resulting money movement.
    ///
    /// Steps run in a fixed order: refund, fee, cleaner payouts, retained revenue.
    /// If a gateway step exhausts its retries the steps before it stay recorded,
    /// the failed step is queued as pending and the error says how far it got.
    #[instrument(skip(self, appointment), fields(appointment_id = %appointment.id))]
    pub async fn settle_cancellation(
        &self,
        appointment: &Appointment,
        cancelled_by: CancelledBy,
        now: DateTime<Utc>,
    ) -> Result<Breakdown> {
        let _guard = self.locks.lock(appointment.id).await;
        let actor = match cancelled_by {
            CancelledBy::Homeowner(id) => Actor::homeowner(id),
            CancelledBy::Cleaner(id) => Actor::cleaner(id),
        };
        let mut op = Operation::new(appointment.id, actor, now);
        let entries = self.ledger.entries_for_appointment(appointment.id).await?;
        if entries.iter().any(is_job_payout) {
            return Err(LedgerError::ValidationError(format!(
                "appointment {} was completed and paid out",
                appointment.id
            )));
        }

        // A re-invocation settles against the original cancellation time so the
        // outcome, and therefore every amount, is the same as the first attempt.
        let cancelled_at = self
            .original_cancellation_time(appointment.id, &entries)
            .await?
            .unwrap_or(now);
        op.effective = cancelled_at;

        self.audit
            .record(
                op.event(AuditEventType::CancellationInitiated)
                    .data(EventData::Cancellation { cancelled_by }),
            )
            .await?;

        let outcome = match policy::compute_cancellation_outcome(
            &self.policy,
            appointment,
            cancelled_by,
            cancelled_at,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "cancellation rejected by policy");
                self.note(op.event(AuditEventType::CancellationOutcomeComputed).data(
                    EventData::Note {
                        text: err.to_string(),
                    },
                ))
                .await;
                return Err(err);
            }
        };
        self.audit
            .record(
                op.event(AuditEventType::CancellationOutcomeComputed)
                    .data(EventData::Outcome {
                        outcome: Box::new(outcome.clone()),
                    }),
            )
            .await?;

        let charge = booking_charge(&entries).ok_or_else(|| {
            LedgerError::PolicyComputation(format!(
                "appointment {} has no captured booking charge",
                appointment.id
            ))
        })?;

        let refund = if outcome.refund_amount.is_zero() {
            None
        } else {
            let entry_type = if outcome.refund_amount == outcome.total_charge {
                EntryType::CancellationRefund
            } else {
                EntryType::CancellationPartialRefund
            };
            // One refund per cancellation whichever type it ends up as.
            let key = idempotency_key(
                appointment.id,
                EntryType::CancellationRefund,
                &KeyScope::Settlement,
            );
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Refund,
                    idempotency_key: key.clone(),
                    amount: outcome.refund_amount,
                    appointment_id: appointment.id,
                    party_user_id: Some(appointment.homeowner_id),
                    source: Some(charge.clone()),
                    description: "Cancellation refund".to_string(),
                },
                entry_type,
                succeeded: AuditEventType::RefundCompleted,
                failed: AuditEventType::RefundFailed,
            };
            let mut draft = op.draft(
                entry_type,
                outcome.refund_amount,
                &KeyScope::Settlement,
                (homeowner(appointment.homeowner_id), PLATFORM),
                "Cancellation refund".to_string(),
            )?;
            draft.idempotency_key = key;
            draft.metadata.rationale = Some(outcome.rationale.clone());
            Some(self.execute(&mut op, step, draft).await?)
        };

        let fee = if outcome.cancellation_fee.is_zero() {
            None
        } else {
            let draft = op.draft(
                EntryType::CancellationFeeRevenue,
                outcome.cancellation_fee,
                &KeyScope::Settlement,
                (homeowner(appointment.homeowner_id), PLATFORM),
                "Cancellation fee".to_string(),
            )?;
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Capture,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: outcome.cancellation_fee,
                    appointment_id: appointment.id,
                    party_user_id: Some(appointment.homeowner_id),
                    source: None,
                    description: "Cancellation fee".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::FeeChargeSucceeded,
                failed: AuditEventType::FeeChargeFailed,
            };
            Some(self.execute(&mut op, step, draft).await?)
        };

        let mut payouts = Vec::new();
        for share in outcome.cleaner_shares.iter().filter(|s| !s.amount.is_zero()) {
            let draft = op.draft(
                EntryType::CleanerPayoutCancellation,
                share.amount,
                &KeyScope::Cleaner(share.cleaner_id),
                (cleaner(share.cleaner_id), PLATFORM),
                "Cancellation compensation".to_string(),
            )?;
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Transfer,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: share.amount,
                    appointment_id: appointment.id,
                    party_user_id: Some(share.cleaner_id),
                    source: None,
                    description: "Cancellation compensation".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::PayoutTransferred,
                failed: AuditEventType::PayoutFailed,
            };
            payouts.push((share.cleaner_id, self.execute(&mut op, step, draft).await?));
        }

        if !outcome.platform_revenue.is_zero() {
            let draft = op.draft(
                EntryType::PlatformFeeCancellation,
                outcome.platform_revenue,
                &KeyScope::Settlement,
                (PLATFORM, PLATFORM),
                "Retained cancellation revenue".to_string(),
            )?;
            self.post(&mut op, PostingPair::new(draft, Utc::now())).await?;
        }

        let breakdown = self.breakdown(
            appointment,
            &outcome,
            cancelled_at,
            refund.as_ref(),
            fee.as_ref(),
            &payouts,
        )?;
        self.audit
            .record(
                op.event(AuditEventType::SettlementCompleted)
                    .data(EventData::Settlement {
                        confirmation_id: breakdown.confirmation_id.clone(),
                        net_cost: breakdown.net_cost.net_cost,
                    }),
            )
            .await?;
        info!(
            confirmation_id = %breakdown.confirmation_id,
            refund = %breakdown.refund.amount,
            fee = %breakdown.cancellation_fee.amount,
            "cancellation settled"
        );
        Ok(breakdown)
    }

    /// Moves the money an approved appeal grants.
    ///
    /// Every amount is validated against the ledger before the first gateway call.
    #[instrument(skip(self, appeal, resolution), fields(appeal_id = %appeal.id))]
    pub async fn settle_appeal_relief(
        &self,
        appeal: &Appeal,
        resolution: &Resolution,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<ReliefSummary> {
        let _guard = self.locks.lock(appeal.appointment_id).await;
        let mut op = Operation::new(appeal.appointment_id, actor, now);
        op.appeal_id = Some(appeal.id);
        let entries = self.ledger.entries_for_appointment(appeal.appointment_id).await?;

        let charged: Money = debits(&entries)
            .filter(|e| e.entry_type.is_booking_charge())
            .map(|e| e.amount)
            .sum();
        // Caps count only what other settlements moved, so a retry of this
        // appeal sees the same limits as its first attempt.
        let appeal_id = appeal.id;
        let earlier = || debits(&entries).filter(move |e| e.metadata.appeal_id != Some(appeal_id));
        let refunded: Money = earlier()
            .filter(|e| e.entry_type.is_refund())
            .map(|e| e.amount)
            .sum();
        let fee_entry =
            debits(&entries).find(|e| e.entry_type == EntryType::CancellationFeeRevenue);
        let fee_already_reversed: Money = earlier()
            .filter(|e| e.entry_type == EntryType::AppealFeeReversal)
            .map(|e| e.amount)
            .sum();
        let payout_already_restored: Money = earlier()
            .filter(|e| {
                e.entry_type == EntryType::CleanerPayoutCancellation
                    && e.metadata.appeal_id.is_some()
                    && e.party_user_id == Some(appeal.appealer_id)
            })
            .map(|e| e.amount)
            .sum();
        let homeowner_id = booking_homeowner(&entries).ok_or_else(|| {
            LedgerError::NotFound(format!(
                "booking charge for appointment {}",
                appeal.appointment_id
            ))
        })?;

        let reverse_fee = resolution.fee_refunded
            || (resolution.penalty_waived && appeal.appealer_type == AppealerType::Homeowner);
        let fee_reversal = match fee_entry {
            Some(fee) if reverse_fee => fee.amount.saturating_sub(fee_already_reversed),
            _ => Money::ZERO,
        };
        let refundable = charged.saturating_sub(refunded);
        if resolution.refund_amount > refundable {
            return Err(LedgerError::ValidationError(format!(
                "refund of {} exceeds the {} still refundable",
                resolution.refund_amount, refundable
            )));
        }
        let restored_payout =
            if resolution.penalty_waived && appeal.appealer_type == AppealerType::Cleaner {
                appeal
                    .original_penalty_amount
                    .saturating_sub(payout_already_restored)
            } else {
                Money::ZERO
            };

        let mut summary = ReliefSummary::default();

        if let Some(fee) = fee_entry.filter(|_| !fee_reversal.is_zero()) {
            let mut draft = op.draft(
                EntryType::AppealFeeReversal,
                fee_reversal,
                &KeyScope::Appeal(appeal.id),
                (PLATFORM, homeowner(homeowner_id)),
                "Cancellation fee reversed on appeal".to_string(),
            )?;
            draft.metadata.reverses_entry_id = Some(fee.id);
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Refund,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: fee_reversal,
                    appointment_id: appeal.appointment_id,
                    party_user_id: Some(homeowner_id),
                    source: fee.gateway_object.clone(),
                    description: "Cancellation fee reversal".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::RefundCompleted,
                failed: AuditEventType::RefundFailed,
            };
            let pair = self.execute(&mut op, step, draft).await?;
            summary.fee_reversed = pair.amount();
            summary.entry_ids.extend(pair.entry_ids());
        }

        if !resolution.refund_amount.is_zero() {
            let charge = booking_charge(&entries).ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "booking charge for appointment {}",
                    appeal.appointment_id
                ))
            })?;
            let draft = op.draft(
                EntryType::AppealRefund,
                resolution.refund_amount,
                &KeyScope::Appeal(appeal.id),
                (homeowner(homeowner_id), PLATFORM),
                "Refund granted on appeal".to_string(),
            )?;
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Refund,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: resolution.refund_amount,
                    appointment_id: appeal.appointment_id,
                    party_user_id: Some(homeowner_id),
                    source: Some(charge),
                    description: "Appeal refund".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::RefundCompleted,
                failed: AuditEventType::RefundFailed,
            };
            let pair = self.execute(&mut op, step, draft).await?;
            summary.refunded = pair.amount();
            summary.entry_ids.extend(pair.entry_ids());
        }

        if !restored_payout.is_zero() {
            let draft = op.draft(
                EntryType::CleanerPayoutCancellation,
                restored_payout,
                &KeyScope::AppealCleaner(appeal.id, appeal.appealer_id),
                (cleaner(appeal.appealer_id), PLATFORM),
                "Forfeited payout restored on appeal".to_string(),
            )?;
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Transfer,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: restored_payout,
                    appointment_id: appeal.appointment_id,
                    party_user_id: Some(appeal.appealer_id),
                    source: None,
                    description: "Restored cleaner payout".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::PayoutTransferred,
                failed: AuditEventType::PayoutFailed,
            };
            let pair = self.execute(&mut op, step, draft).await?;
            summary.payout_restored = pair.amount();
            summary.entry_ids.extend(pair.entry_ids());
        }

        self.audit
            .record(op.event(AuditEventType::AppealReliefSettled).data(EventData::Note {
                text: format!(
                    "fee reversed {}, refunded {}, payout restored {}",
                    summary.fee_reversed, summary.refunded, summary.payout_restored
                ),
            }))
            .await?;
        Ok(summary)
    }

    /// Records a processor notification. Redelivery of the same event is a no-op.
    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn handle_webhook(&self, event: &WebhookEvent) -> Result<Option<PostOutcome>> {
        let _guard = self.locks.lock(event.appointment_id).await;
        let mut op = Operation::new(event.appointment_id, Actor::system(), event.occurred_at);
        let object = event.kind.object().clone();
        let scope = KeyScope::Gateway(object.object_id.clone());

        let draft = match &event.kind {
            WebhookKind::ChargeSucceeded { processing_fee, .. } if processing_fee.is_zero() => None,
            WebhookKind::ChargeSucceeded { processing_fee, .. } => Some(op.draft(
                EntryType::StripeFee,
                *processing_fee,
                &scope,
                ((PartyType::Gateway, None), PLATFORM),
                "Processor fee".to_string(),
            )?),
            WebhookKind::DisputeOpened { amount, .. } => Some(op.draft(
                EntryType::DisputeChargeback,
                *amount,
                &scope,
                (homeowner(event.homeowner_id), PLATFORM),
                "Dispute chargeback".to_string(),
            )?),
            WebhookKind::DisputeWon { amount, .. } => Some(op.draft(
                EntryType::DisputeReversal,
                *amount,
                &scope,
                (PLATFORM, homeowner(event.homeowner_id)),
                "Dispute won".to_string(),
            )?),
        };

        let outcome = match draft {
            Some(draft) => {
                let pair = PostingPair::new(
                    PairDraft {
                        gateway_object: Some(object.clone()),
                        ..draft
                    },
                    Utc::now(),
                );
                Some(self.post(&mut op, pair).await?)
            }
            None => None,
        };

        self.audit
            .record(op.event(AuditEventType::WebhookProcessed).data(EventData::Webhook {
                event_id: event.event_id.clone(),
                object,
            }))
            .await?;
        Ok(outcome)
    }

    /// Pays the cleaners of a completed job and books the platform's share.
    #[instrument(skip(self, appointment), fields(appointment_id = %appointment.id))]
    pub async fn payout_completed_job(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<Vec<PostingPair>> {
        let _guard = self.locks.lock(appointment.id).await;
        let mut op = Operation::new(appointment.id, Actor::system(), now);
        let entries = self.ledger.entries_for_appointment(appointment.id).await?;
        if booking_charge(&entries).is_none() {
            return Err(LedgerError::ValidationError(format!(
                "appointment {} has no captured booking charge",
                appointment.id
            )));
        }
        if entries.iter().any(is_cancellation_settlement) {
            return Err(LedgerError::ValidationError(format!(
                "appointment {} was cancelled",
                appointment.id
            )));
        }

        let shares = policy::job_payout_shares(&self.policy, appointment)?;
        let mut pairs = Vec::new();
        for share in shares.iter().filter(|s| !s.amount.is_zero()) {
            let draft = op.draft(
                EntryType::CleanerPayoutJob,
                share.amount,
                &KeyScope::Cleaner(share.cleaner_id),
                (cleaner(share.cleaner_id), PLATFORM),
                "Job payout".to_string(),
            )?;
            let step = GatewayStep {
                request: GatewayRequest {
                    operation: GatewayOperation::Transfer,
                    idempotency_key: draft.idempotency_key.clone(),
                    amount: share.amount,
                    appointment_id: appointment.id,
                    party_user_id: Some(share.cleaner_id),
                    source: None,
                    description: "Job payout".to_string(),
                },
                entry_type: draft.entry_type,
                succeeded: AuditEventType::PayoutTransferred,
                failed: AuditEventType::PayoutFailed,
            };
            pairs.push(self.execute(&mut op, step, draft).await?);
        }

        let paid: Money = shares.iter().map(|s| s.amount).sum();
        let platform_share = appointment.total_charge().saturating_sub(paid);
        if !platform_share.is_zero() {
            let draft = op.draft(
                EntryType::PlatformFeeBooking,
                platform_share,
                &KeyScope::Booking,
                (PLATFORM, PLATFORM),
                "Platform share of completed job".to_string(),
            )?;
            pairs.push(self.post(&mut op, PostingPair::new(draft, Utc::now())).await?.into_pair());
        }
        Ok(pairs)
    }

    #[instrument(skip(self, actor))]
    pub async fn award_cleaner_bonus(
        &self,
        appointment_id: AppointmentId,
        cleaner_id: UserId,
        amount: Money,
        bonus_id: Uuid,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<PostingPair> {
        if !actor.role.is_staff() {
            return Err(LedgerError::Unauthorized(
                "only staff may award bonuses".to_string(),
            ));
        }
        if amount.is_zero() {
            return Err(LedgerError::ValidationError("bonus must be positive".to_string()));
        }
        let _guard = self.locks.lock(appointment_id).await;
        let mut op = Operation::new(appointment_id, actor, now);
        let draft = op.draft(
            EntryType::CleanerBonus,
            amount,
            &KeyScope::Manual(bonus_id),
            (cleaner(cleaner_id), PLATFORM),
            "Cleaner bonus".to_string(),
        )?;
        let step = GatewayStep {
            request: GatewayRequest {
                operation: GatewayOperation::Transfer,
                idempotency_key: draft.idempotency_key.clone(),
                amount,
                appointment_id,
                party_user_id: Some(cleaner_id),
                source: None,
                description: "Cleaner bonus".to_string(),
            },
            entry_type: draft.entry_type,
            succeeded: AuditEventType::PayoutTransferred,
            failed: AuditEventType::PayoutFailed,
        };
        self.execute(&mut op, step, draft).await
    }

    /// Posts an operator correction. No money moves through the gateway.
    #[instrument(
        skip(self, adjustment, actor),
        fields(appointment_id = %adjustment.appointment_id)
    )]
    pub async fn post_manual_adjustment(
        &self,
        adjustment: ManualAdjustment,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<PostingPair> {
        if !actor.role.is_staff() {
            return Err(LedgerError::Unauthorized(
                "only staff may post manual adjustments".to_string(),
            ));
        }
        if adjustment.reason.trim().is_empty() {
            return Err(LedgerError::ValidationError(
                "a manual adjustment needs a reason".to_string(),
            ));
        }
        if adjustment.amount.is_zero() {
            return Err(LedgerError::ValidationError(
                "a manual adjustment must be positive".to_string(),
            ));
        }

        let _guard = self.locks.lock(adjustment.appointment_id).await;
        let mut op = Operation::new(adjustment.appointment_id, actor, now);
        if let Some(reversed) = adjustment.reverses_entry_id {
            let entries = self.ledger.entries_for_appointment(adjustment.appointment_id).await?;
            if !entries.iter().any(|e| e.id == reversed) {
                return Err(LedgerError::NotFound(format!("ledger entry {reversed}")));
            }
        }

        let pair = PostingPair::new(
            PairDraft {
                appointment_id: adjustment.appointment_id,
                entry_type: EntryType::ManualAdjustment,
                amount: adjustment.amount,
                debit: adjustment.debit,
                credit: adjustment.credit,
                gateway_object: None,
                idempotency_key: idempotency_key(
                    adjustment.appointment_id,
                    EntryType::ManualAdjustment,
                    &KeyScope::Manual(adjustment.adjustment_id),
                ),
                effective_date: now,
                metadata: EntryMetadata {
                    description: "Manual adjustment".to_string(),
                    rationale: Some(adjustment.reason.clone()),
                    reverses_entry_id: adjustment.reverses_entry_id,
                    actor_id: actor.id,
                    request_id: Some(op.request_id),
                    ..Default::default()
                },
            },
            Utc::now(),
        );
        let pair = self.post(&mut op, pair).await?.into_pair();
        self.audit
            .record(op.event(AuditEventType::ManualAdjustmentPosted).data(EventData::Note {
                text: adjustment.reason,
            }))
            .await?;
        Ok(pair)
    }

    /// Retries ledger writes whose money already moved. Gateway-exhausted steps
    /// stay queued until their settlement is re-invoked.
    #[instrument(skip(self))]
    pub async fn replay_pending(&self, now: DateTime<Utc>) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for pending in self.ledger.pending_postings().await? {
            let PendingStage::LedgerWriteFailed { pair, .. } = pending.stage else {
                report.still_pending += 1;
                continue;
            };
            let _guard = self.locks.lock(pending.appointment_id).await;
            let mut op = Operation::new(pending.appointment_id, Actor::system(), now);
            op.request_id = pair.debit.metadata.request_id.unwrap_or(op.request_id);
            match self.post(&mut op, *pair).await {
                Ok(_) => report.replayed += 1,
                Err(err) => {
                    warn!(
                        key = %pending.idempotency_key,
                        error = %err,
                        "pending posting still failing"
                    );
                    report.still_pending += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn pending(&self) -> Result<Vec<PendingPosting>> {
        self.ledger.pending_postings().await
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry.min_delay())
            .with_max_delay(self.retry.max_delay())
            .with_max_times(self.retry.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    /// Returns the pair already recorded under `key`, finishing a queued ledger
    /// write first if that is where the previous attempt stopped.
    async fn already_posted(&self, op: &mut Operation, key: &str) -> Result<Option<PostingPair>> {
        if let Some(pair) = self.ledger.find_by_key(key).await? {
            op.completed_steps += 1;
            return Ok(Some(pair));
        }
        let queued = self
            .ledger
            .pending_postings()
            .await?
            .into_iter()
            .find(|p| p.idempotency_key == key);
        if let Some(PendingPosting {
            stage: PendingStage::LedgerWriteFailed { pair, .. },
            ..
        }) = queued
        {
            op.completed_steps += 1;
            return Ok(Some(self.post(op, *pair).await?.into_pair()));
        }
        Ok(None)
    }

    /// Runs one gateway step, then records its pair.
    async fn execute(
        &self,
        op: &mut Operation,
        step: GatewayStep,
        draft: PairDraft,
    ) -> Result<PostingPair> {
        if let Some(pair) = self.already_posted(op, &step.request.idempotency_key).await? {
            debug!(key = %step.request.idempotency_key, "step already settled");
            return Ok(pair);
        }
        let receipt = self.call_gateway(op, &step).await?;
        let pair = PostingPair::new(
            PairDraft {
                gateway_object: Some(receipt.object),
                ..draft
            },
            Utc::now(),
        );
        Ok(self.post(op, pair).await?.into_pair())
    }

    async fn call_gateway(&self, op: &mut Operation, step: &GatewayStep) -> Result<GatewayReceipt> {
        let request = &step.request;
        let mut delays = self.backoff().build();
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let result = match request.operation {
                GatewayOperation::Capture => self.gateway.capture(request).await,
                GatewayOperation::Refund => self.gateway.refund(request).await,
                GatewayOperation::Transfer => self.gateway.transfer(request).await,
            };
            match result {
                Err(err) if err.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            operation = %request.operation,
                            key = %request.idempotency_key,
                            attempt = attempts,
                            error = %err,
                            "transient gateway failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(err),
                },
                other => break other,
            }
        };

        match result {
            Ok(receipt) => {
                op.completed_steps += 1;
                self.audit
                    .record(op.event(step.succeeded).data(EventData::GatewayCall {
                        operation: request.operation.to_string(),
                        amount: request.amount,
                        idempotency_key: request.idempotency_key.clone(),
                        object: Some(receipt.object.clone()),
                        attempts,
                        error: None,
                    }))
                    .await?;
                Ok(receipt)
            }
            Err(err) => {
                error!(
                    operation = %request.operation,
                    key = %request.idempotency_key,
                    attempts,
                    error = %err,
                    "gateway step failed"
                );
                self.note(op.event(step.failed).data(EventData::GatewayCall {
                    operation: request.operation.to_string(),
                    amount: request.amount,
                    idempotency_key: request.idempotency_key.clone(),
                    object: None,
                    attempts,
                    error: Some(err.to_string()),
                }))
                .await;
                self.queue(
                    op,
                    PendingPosting {
                        idempotency_key: request.idempotency_key.clone(),
                        appointment_id: request.appointment_id,
                        entry_type: step.entry_type,
                        amount: request.amount,
                        stage: PendingStage::GatewayExhausted {
                            operation: request.operation.to_string(),
                            last_error: err.to_string(),
                        },
                        recorded_at: op.now,
                    },
                )
                .await;
                Err(LedgerError::GatewayCall {
                    operation: request.operation.to_string(),
                    attempts,
                    completed_steps: op.completed_steps,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Posts a pair with bounded retries. Invariant violations are never retried.
    async fn post(&self, op: &mut Operation, pair: PostingPair) -> Result<PostOutcome> {
        let before = LedgerTotals::from_entries(
            &self.ledger.entries_for_appointment(pair.appointment_id()).await?,
        );
        let mut delays = self.backoff().build();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.ledger.post_pair(pair.clone()).await {
                Ok(outcome) => {
                    let after = if outcome.is_duplicate() {
                        before
                    } else {
                        before.with_pair(outcome.pair())
                    };
                    if let Err(err) = self.ledger.clear_pending(pair.idempotency_key()).await {
                        warn!(
                            key = %pair.idempotency_key(),
                            error = %err,
                            "could not clear pending posting"
                        );
                    }
                    let posted = outcome.pair();
                    debug!(
                        key = %posted.idempotency_key(),
                        entry_type = %posted.entry_type(),
                        amount = %posted.amount(),
                        duplicate = outcome.is_duplicate(),
                        "posting pair recorded"
                    );
                    self.audit
                        .record(
                            op.event(AuditEventType::LedgerEntriesPosted)
                                .data(EventData::Posting {
                                    entry_type: posted.entry_type(),
                                    amount: posted.amount(),
                                    entry_ids: posted.entry_ids().to_vec(),
                                    duplicate: outcome.is_duplicate(),
                                })
                                .states(
                                    Some(StateSnapshot::LedgerTotals(before)),
                                    Some(StateSnapshot::LedgerTotals(after)),
                                ),
                        )
                        .await?;
                    return Ok(outcome);
                }
                Err(err @ LedgerError::LedgerInvariantViolation { .. }) => {
                    error!(
                        key = %pair.idempotency_key(),
                        error = %err,
                        "ledger invariant violation"
                    );
                    self.note(
                        op.event(AuditEventType::LedgerInvariantViolation)
                            .data(EventData::Invariant {
                                entry_type: pair.entry_type(),
                                amount: pair.amount(),
                                detail: err.to_string(),
                            })
                            .states(Some(StateSnapshot::LedgerTotals(before)), None),
                    )
                    .await;
                    if pair.debit.gateway_object.is_some() {
                        self.queue_write(op, &pair, &err).await;
                    }
                    return Err(err);
                }
                Err(err) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            key = %pair.idempotency_key(),
                            attempt = attempts,
                            error = %err,
                            "ledger write failed, retrying"
                        );
                        self.note(op.event(AuditEventType::LedgerPostRetried).data(EventData::Note {
                            text: format!("attempt {attempts}: {err}"),
                        }))
                        .await;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            key = %pair.idempotency_key(),
                            attempts,
                            error = %err,
                            "ledger write retries exhausted"
                        );
                        self.queue_write(op, &pair, &err).await;
                        return Err(err);
                    }
                },
            }
        }
    }

    async fn queue_write(&self, op: &Operation, pair: &PostingPair, err: &LedgerError) {
        self.queue(
            op,
            PendingPosting {
                idempotency_key: pair.idempotency_key().to_string(),
                appointment_id: pair.appointment_id(),
                entry_type: pair.entry_type(),
                amount: pair.amount(),
                stage: PendingStage::LedgerWriteFailed {
                    pair: Box::new(pair.clone()),
                    last_error: err.to_string(),
                },
                recorded_at: op.now,
            },
        )
        .await;
    }

    async fn queue(&self, op: &Operation, pending: PendingPosting) {
        let text = format!(
            "{} of {} queued: {:?}",
            pending.entry_type, pending.amount, pending.stage
        );
        if let Err(err) = self.ledger.record_pending(pending).await {
            error!(error = %err, "could not queue pending posting");
        }
        self.note(op.event(AuditEventType::SettlementPending).data(EventData::Note { text }))
            .await;
    }

    /// Audit write on a failure path; losing it must not mask the original error.
    async fn note(&self, event: AuditEvent) {
        let event_type = event.event_type;
        if let Err(err) = self.audit.record(event).await {
            error!(%event_type, error = %err, "could not record audit event");
        }
    }

    async fn original_cancellation_time(
        &self,
        appointment_id: AppointmentId,
        entries: &[LedgerEntry],
    ) -> Result<Option<DateTime<Utc>>> {
        let posted = entries
            .iter()
            .filter(|e| is_cancellation_settlement(e))
            .map(|e| e.effective_date);
        let queued: Vec<DateTime<Utc>> = self
            .ledger
            .pending_postings()
            .await?
            .into_iter()
            .filter_map(|p| match p.stage {
                PendingStage::LedgerWriteFailed { pair, .. }
                    if pair.appointment_id() == appointment_id
                        && is_cancellation_settlement(&pair.debit) =>
                {
                    Some(pair.debit.effective_date)
                }
                _ => None,
            })
            .collect();
        Ok(posted.chain(queued).min())
    }

    fn breakdown(
        &self,
        appointment: &Appointment,
        outcome: &CancellationOutcome,
        cancelled_at: DateTime<Utc>,
        refund: Option<&PostingPair>,
        fee: Option<&PostingPair>,
        payouts: &[(UserId, PostingPair)],
    ) -> Result<Breakdown> {
        let gateway_ref = |pair: &PostingPair| {
            pair.debit.gateway_object.as_ref().map(|o| o.object_id.clone())
        };
        let offset = FixedOffset::east_opt(self.policy.utc_offset_minutes * 60).ok_or_else(|| {
            LedgerError::PolicyComputation("invalid UTC offset".to_string())
        })?;

        let refund_amount = refund.map(|p| p.amount()).unwrap_or(Money::ZERO);
        let fee_amount = fee.map(|p| p.amount()).unwrap_or(Money::ZERO);
        let payout_total: Money = payouts.iter().map(|(_, p)| p.amount()).sum();
        let total = outcome.total_charge;
        let net_cost = total.saturating_sub(refund_amount) + fee_amount;

        Ok(Breakdown {
            confirmation_id: confirmation_id(
                appointment.id,
                cancelled_at.with_timezone(&offset).date_naive(),
            ),
            appointment_id: appointment.id,
            cancelled_at,
            days_until: outcome.days_until,
            window: outcome.window,
            original_charges: OriginalCharges {
                items: appointment.line_items(),
                total,
            },
            refund: RefundDetails {
                eligible: !refund_amount.is_zero(),
                amount: refund_amount,
                percentage: outcome.refund_percentage,
                reason: outcome.rationale.clone(),
                payment_method_label: appointment.payment_method_label.clone(),
                gateway_ref: refund.and_then(gateway_ref),
            },
            cancellation_fee: FeeDetails {
                applicable: !fee_amount.is_zero(),
                amount: fee_amount,
                status: if fee_amount.is_zero() {
                    FeeStatus::NotApplicable
                } else {
                    FeeStatus::Charged
                },
                gateway_ref: fee.and_then(gateway_ref),
            },
            cleaner_compensation: CleanerCompensation {
                total: payout_total,
                shares: payouts
                    .iter()
                    .map(|(cleaner_id, pair)| CleanerPayoutLine {
                        cleaner_id: *cleaner_id,
                        amount: pair.amount(),
                        gateway_ref: gateway_ref(pair),
                    })
                    .collect(),
            },
            platform: PlatformSummary {
                fee_revenue: fee_amount,
                retained_revenue: outcome.platform_revenue,
                total: fee_amount + outcome.platform_revenue,
            },
            net_cost: NetCostSummary {
                total_charged: total,
                refunded: refund_amount,
                fee_charged: fee_amount,
                net_cost,
            },
            appeal: AppealEligibility {
                eligible: true,
                deadline: cancelled_at + Duration::hours(self.policy.appeal_window_hours),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_id_is_stable_per_appointment() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let id = confirmation_id(AppointmentId(7), day);
        assert!(id.starts_with("CXL-20260310-"));
        assert_eq!(id.len(), "CXL-20260310-".len() + 6);
        assert!(id[13..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(id, confirmation_id(AppointmentId(7), day));
        assert_ne!(id, confirmation_id(AppointmentId(8), day));
    }
}
