mod common;

use async_trait::async_trait;
use common::{
    CLEANER, HOMEOWNER, REVIEWER, appointment, at, config, harness, harness_with, late_cancellation,
};
use homeclean_ledger::application::engine::LedgerEngine;
use homeclean_ledger::config::CancellationFeePolicy;
use homeclean_ledger::domain::appeal::{
    Actor, AppealCategory, AppealRequest, AppealStatus, AppealerType, ContestedItem, Decision,
    EscalationReason, Priority, Resolution, Severity, SupportingDocument,
};
use homeclean_ledger::domain::appointment::{Appointment, CancelledBy};
use homeclean_ledger::domain::audit::AuditEventType;
use homeclean_ledger::domain::gateway::{GatewayError, GatewayReceipt, GatewayRequest};
use homeclean_ledger::domain::ids::UserId;
use homeclean_ledger::domain::ledger::{Direction, EntryType, GatewayObjectRef};
use homeclean_ledger::domain::money::Money;
use homeclean_ledger::domain::ports::PaymentGateway;
use homeclean_ledger::error::LedgerError;
use homeclean_ledger::infrastructure::in_memory::{
    InMemoryAppealStore, InMemoryAuditStore, InMemoryLedgerStore,
};
use homeclean_ledger::infrastructure::sandbox_gateway::SandboxGateway;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sandbox gateway whose transfers can be switched off.
struct TransferSwitch {
    inner: SandboxGateway,
    blocked: AtomicBool,
}

#[async_trait]
impl PaymentGateway for TransferSwitch {
    async fn capture(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.inner.capture(request).await
    }

    async fn refund(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        self.inner.refund(request).await
    }

    async fn transfer(&self, request: &GatewayRequest) -> Result<GatewayReceipt, GatewayError> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("destination account frozen".to_string()));
        }
        self.inner.transfer(request).await
    }

    async fn retrieve(
        &self,
        object: &GatewayObjectRef,
    ) -> Result<Option<GatewayReceipt>, GatewayError> {
        self.inner.retrieve(object).await
    }
}

fn homeowner_appeal(appointment: &Appointment) -> AppealRequest {
    AppealRequest {
        appointment_id: appointment.id,
        appealer_id: HOMEOWNER,
        appealer_type: AppealerType::Homeowner,
        category: AppealCategory::MedicalEmergency,
        severity: Severity::High,
        description: "Admitted to hospital the night before".to_string(),
        supporting_documents: vec![],
        contesting_items: BTreeSet::from([ContestedItem::Fee]),
        requested_relief: Money::from_cents(2000),
    }
}

fn fee_waiver() -> Resolution {
    Resolution {
        fee_refunded: true,
        ..Resolution::default()
    }
}

fn reviewer() -> Actor {
    Actor::reviewer(REVIEWER)
}

fn cleaner_appeal(appointment: &Appointment) -> AppealRequest {
    AppealRequest {
        appealer_id: CLEANER,
        appealer_type: AppealerType::Cleaner,
        category: AppealCategory::Transportation,
        severity: Severity::Medium,
        contesting_items: BTreeSet::from([ContestedItem::Penalty]),
        ..homeowner_appeal(appointment)
    }
}

fn waive_penalty() -> Decision {
    Decision::Approve {
        resolution: Resolution {
            penalty_waived: true,
            ..Resolution::default()
        },
    }
}

async fn restored_payouts(engine: &LedgerEngine, appointment: &Appointment) -> Vec<Money> {
    engine
        .entries(Some(appointment.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.entry_type == EntryType::CleanerPayoutCancellation
                && e.direction == Direction::Debit
                && e.metadata.appeal_id.is_some()
        })
        .map(|e| e.amount)
        .collect()
}

#[tokio::test]
async fn test_approved_appeal_reverses_fee() {
    let mut cfg = config();
    cfg.policy.cancellation_fee = CancellationFeePolicy::Flat {
        amount: Money::from_cents(2000),
    };
    let h = harness_with(cfg);
    let appt = appointment(1);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let fee_before: Vec<_> = h
        .engine
        .entries(Some(appt.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.entry_type == EntryType::CancellationFeeRevenue)
        .collect();

    let appeals = h.engine.appeals();
    let appeal = appeals
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 11, 9))
        .await
        .unwrap();
    assert_eq!(appeal.status, AppealStatus::Submitted);
    assert_eq!(appeal.priority, Priority::Urgent);
    assert_eq!(appeal.sla_deadline, at(2026, 3, 11, 21));
    assert_eq!(appeal.original_penalty_amount, Money::from_cents(2000));
    assert_eq!(appeal.original_refund_withheld, Money::from_cents(7500));

    appeals
        .start_review(appeal.id, reviewer(), at(2026, 3, 11, 10))
        .await
        .unwrap();
    let resolved = appeals
        .resolve(
            appeal.id,
            Decision::Approve {
                resolution: fee_waiver(),
            },
            Some("documented emergency".to_string()),
            reviewer(),
            at(2026, 3, 11, 11),
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, AppealStatus::Approved);
    assert!(resolved.relief_settled);
    assert_eq!(resolved.reviewed_by, Some(REVIEWER));

    let entries = h.engine.entries(Some(appt.id)).await.unwrap();
    let reversal: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::AppealFeeReversal)
        .collect();
    assert_eq!(reversal.len(), 2);
    assert_eq!(reversal[0].amount, Money::from_cents(2000));
    let original_fee = fee_before.iter().find(|e| e.direction == Direction::Debit).unwrap();
    assert_eq!(reversal[0].metadata.reverses_entry_id, Some(original_fee.id));
    assert_eq!(reversal[0].metadata.appeal_id, Some(appeal.id));

    let fee_after: Vec<_> = entries
        .into_iter()
        .filter(|e| e.entry_type == EntryType::CancellationFeeRevenue)
        .collect();
    assert_eq!(fee_after, fee_before);
    assert!(h.engine.totals(appt.id).await.unwrap().is_balanced());
}

#[tokio::test]
async fn test_appeal_needs_a_settled_cancellation_and_an_open_window() {
    let h = harness();
    let appt = appointment(2);
    let early = h
        .engine
        .appeals()
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 11, 9))
        .await;
    assert!(matches!(early, Err(LedgerError::ValidationError(_))));

    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let late = h
        .engine
        .appeals()
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 13, 10))
        .await;
    assert!(matches!(late, Err(LedgerError::ValidationError(_))));

    let mut stranger = homeowner_appeal(&appt);
    stranger.appealer_id = UserId(55);
    let unauthorized = h
        .engine
        .appeals()
        .submit(stranger, &appt, at(2026, 3, 11, 9))
        .await;
    assert!(matches!(unauthorized, Err(LedgerError::Unauthorized(_))));
}

#[tokio::test]
async fn test_document_round_trip_and_denial() {
    let h = harness();
    let appt = appointment(3);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let appeals = h.engine.appeals();
    let appeal = appeals
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();

    appeals.start_review(appeal.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();
    let waiting = appeals
        .request_documents(
            appeal.id,
            "please upload the discharge letter".to_string(),
            reviewer(),
            at(2026, 3, 10, 14),
        )
        .await
        .unwrap();
    assert_eq!(waiting.status, AppealStatus::AwaitingDocuments);

    let with_docs = appeals
        .add_documents(
            appeal.id,
            vec![SupportingDocument {
                url: "https://files.example/discharge.pdf".to_string(),
                doc_type: "medical".to_string(),
                uploaded_at: at(2026, 3, 10, 15),
            }],
            Actor::homeowner(HOMEOWNER),
            at(2026, 3, 10, 15),
        )
        .await
        .unwrap();
    assert_eq!(with_docs.status, AppealStatus::AwaitingDocuments);
    assert_eq!(with_docs.supporting_documents.len(), 1);

    appeals.start_review(appeal.id, reviewer(), at(2026, 3, 10, 16)).await.unwrap();
    let no_notes = appeals
        .resolve(appeal.id, Decision::Deny, None, reviewer(), at(2026, 3, 10, 17))
        .await;
    assert!(matches!(no_notes, Err(LedgerError::ValidationError(_))));

    let denied = appeals
        .resolve(
            appeal.id,
            Decision::Deny,
            Some("letter is dated after the cancellation".to_string()),
            reviewer(),
            at(2026, 3, 10, 17),
        )
        .await
        .unwrap();
    assert_eq!(denied.status, AppealStatus::Denied);
    assert!(!denied.relief_settled);

    let err = appeals
        .start_review(appeal.id, reviewer(), at(2026, 3, 10, 18))
        .await
        .unwrap_err();
    assert_eq!(err.user_message(), "appeal is already denied");

    let closed = appeals.close(appeal.id, Actor::system(), at(2026, 3, 20, 0)).await.unwrap();
    assert_eq!(closed.status, AppealStatus::Closed);
    let err = appeals
        .add_documents(appeal.id, vec![], Actor::homeowner(HOMEOWNER), at(2026, 3, 21, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ValidationError(_)));
}

#[tokio::test]
async fn test_only_staff_move_appeals() {
    let h = harness();
    let appt = appointment(4);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let appeal = h
        .engine
        .appeals()
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();

    let err = h
        .engine
        .appeals()
        .start_review(appeal.id, Actor::homeowner(HOMEOWNER), at(2026, 3, 10, 13))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAppealTransition { .. }));

    // Approving straight from submitted skips the review.
    let err = h
        .engine
        .appeals()
        .resolve(
            appeal.id,
            Decision::Approve {
                resolution: fee_waiver(),
            },
            None,
            reviewer(),
            at(2026, 3, 10, 13),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAppealTransition { .. }));
    assert_eq!(
        h.engine.appeals().get(appeal.id).await.unwrap().status,
        AppealStatus::Submitted
    );
}

#[tokio::test]
async fn test_overdue_appeals_escalate() {
    let h = harness();
    let appt = appointment(5);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let appeals = h.engine.appeals();
    let appeal = appeals
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();

    let premature = appeals
        .escalate(appeal.id, EscalationReason::SlaBreach, reviewer(), at(2026, 3, 10, 13))
        .await
        .unwrap_err();
    assert_eq!(premature.user_message(), "the SLA has not been breached");

    assert!(appeals.escalate_overdue(at(2026, 3, 10, 20)).await.unwrap().is_empty());
    let escalated = appeals.escalate_overdue(at(2026, 3, 11, 1)).await.unwrap();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].status, AppealStatus::Escalated);
    assert_eq!(escalated[0].escalation_reason, Some(EscalationReason::SlaBreach));
    assert!(appeals.overdue(at(2026, 3, 12, 0)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refund_relief_is_capped() {
    let h = harness();
    let appt = appointment(6);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let appeals = h.engine.appeals();
    let appeal = appeals
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();
    appeals.start_review(appeal.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();

    let too_much = Resolution {
        refund_amount: Money::from_cents(7501),
        ..Resolution::default()
    };
    let err = appeals
        .resolve(
            appeal.id,
            Decision::PartiallyApprove { resolution: too_much },
            None,
            reviewer(),
            at(2026, 3, 10, 14),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ValidationError(_)));
    assert_eq!(appeals.get(appeal.id).await.unwrap().status, AppealStatus::UnderReview);

    let partial = Resolution {
        refund_amount: Money::from_cents(5000),
        ..Resolution::default()
    };
    let resolved = appeals
        .resolve(
            appeal.id,
            Decision::PartiallyApprove { resolution: partial },
            Some("half of the withheld amount".to_string()),
            reviewer(),
            at(2026, 3, 10, 14),
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, AppealStatus::PartiallyApproved);
    let refunded: Money = h
        .engine
        .entries(Some(appt.id))
        .await
        .unwrap()
        .iter()
        .filter(|e| e.entry_type == EntryType::AppealRefund && e.direction == Direction::Debit)
        .map(|e| e.amount)
        .sum();
    assert_eq!(refunded, Money::from_cents(5000));
}

#[tokio::test]
async fn test_cleaner_appeal_restores_payout() {
    let h = harness();
    let appt = appointment(7);
    let mut request = late_cancellation(appt.clone());
    request.cancelled_by = CancelledBy::Cleaner(CLEANER);
    h.engine.process_cancellation(&request).await.unwrap();

    let appeal = h
        .engine
        .appeals()
        .submit(
            AppealRequest {
                appealer_id: CLEANER,
                appealer_type: AppealerType::Cleaner,
                category: AppealCategory::Transportation,
                severity: Severity::Medium,
                contesting_items: BTreeSet::from([ContestedItem::Penalty]),
                ..homeowner_appeal(&appt)
            },
            &appt,
            at(2026, 3, 10, 12),
        )
        .await
        .unwrap();
    assert_eq!(appeal.original_penalty_amount, Money::from_cents(13500));
    assert_eq!(appeal.priority, Priority::Normal);

    h.engine.appeals().start_review(appeal.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();
    h.engine
        .appeals()
        .resolve(
            appeal.id,
            Decision::Approve {
                resolution: Resolution {
                    penalty_waived: true,
                    ..Resolution::default()
                },
            },
            None,
            reviewer(),
            at(2026, 3, 10, 14),
        )
        .await
        .unwrap();

    let restored: Vec<_> = h
        .engine
        .entries(Some(appt.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.entry_type == EntryType::CleanerPayoutCancellation && e.direction == Direction::Debit
        })
        .collect();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].amount, Money::from_cents(13500));
    assert_eq!(restored[0].party_user_id, Some(CLEANER));
}

#[tokio::test]
async fn test_audit_trail_replays_appeal() {
    let h = harness();
    let appt = appointment(8);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let appeals = h.engine.appeals();
    let appeal = appeals
        .submit(homeowner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();
    appeals.start_review(appeal.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();
    appeals
        .resolve(
            appeal.id,
            Decision::Escalate {
                reason: EscalationReason::ReviewerRequest("amount above my limit".to_string()),
            },
            None,
            reviewer(),
            at(2026, 3, 10, 14),
        )
        .await
        .unwrap();

    let stored = appeals.get(appeal.id).await.unwrap();
    let replayed = h.engine.audit().reconstruct_appeal(appeal.id).await.unwrap();
    assert_eq!(replayed, Some(stored));

    let types: Vec<_> = h
        .engine
        .audit()
        .events_for_appeal(appeal.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            AuditEventType::AppealSubmitted,
            AuditEventType::AppealStatusChanged,
            AuditEventType::AppealEscalated,
        ]
    );

    let totals = h.engine.audit().reconstruct_ledger_totals(appt.id).await.unwrap();
    assert_eq!(totals, h.engine.totals(appt.id).await.unwrap());
}

#[tokio::test]
async fn test_approval_retried_after_failed_transfer() {
    let gateway = Arc::new(TransferSwitch {
        inner: SandboxGateway::new(),
        blocked: AtomicBool::new(false),
    });
    let engine = LedgerEngine::new(
        config(),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemoryAppealStore::new()),
        Arc::new(InMemoryAuditStore::new()),
        gateway.clone(),
    );
    let appt = appointment(9);
    engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();

    let appeals = engine.appeals();
    let appeal = appeals
        .submit(cleaner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();
    appeals.start_review(appeal.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();

    let decision = || Decision::Approve {
        resolution: Resolution {
            penalty_waived: true,
            refund_amount: Money::from_cents(7500),
            ..Resolution::default()
        },
    };
    gateway.blocked.store(true, Ordering::SeqCst);
    let err = appeals
        .resolve(appeal.id, decision(), None, reviewer(), at(2026, 3, 10, 14))
        .await
        .unwrap_err();
    match &err {
        LedgerError::GatewayCall {
            operation,
            completed_steps,
            ..
        } => {
            assert_eq!(operation, "transfer");
            assert_eq!(*completed_steps, 1);
        }
        other => panic!("expected a gateway error, got {other:?}"),
    }
    assert_eq!(appeals.get(appeal.id).await.unwrap().status, AppealStatus::UnderReview);

    // The refund already went out; the retry must accept it as settled.
    gateway.blocked.store(false, Ordering::SeqCst);
    let resolved = appeals
        .resolve(appeal.id, decision(), None, reviewer(), at(2026, 3, 10, 15))
        .await
        .unwrap();
    assert_eq!(resolved.status, AppealStatus::Approved);
    assert!(resolved.relief_settled);

    let appeal_refunds: Vec<_> = engine
        .entries(Some(appt.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.entry_type == EntryType::AppealRefund && e.direction == Direction::Debit)
        .map(|e| e.amount)
        .collect();
    assert_eq!(appeal_refunds, vec![Money::from_cents(7500)]);
    assert_eq!(restored_payouts(&engine, &appt).await, vec![Money::from_cents(13500)]);
    assert!(engine.settlement().pending().await.unwrap().is_empty());
    assert!(engine.totals(appt.id).await.unwrap().is_balanced());
}

#[tokio::test]
async fn test_forfeited_payout_is_restored_once() {
    let h = harness();
    let appt = appointment(10);
    let mut request = late_cancellation(appt.clone());
    request.cancelled_by = CancelledBy::Cleaner(CLEANER);
    h.engine.process_cancellation(&request).await.unwrap();

    let appeals = h.engine.appeals();
    let first = appeals
        .submit(cleaner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await
        .unwrap();
    let second_while_open = appeals
        .submit(cleaner_appeal(&appt), &appt, at(2026, 3, 10, 12))
        .await;
    assert!(matches!(second_while_open, Err(LedgerError::ValidationError(_))));

    appeals.start_review(first.id, reviewer(), at(2026, 3, 10, 13)).await.unwrap();
    appeals
        .resolve(first.id, waive_penalty(), None, reviewer(), at(2026, 3, 10, 14))
        .await
        .unwrap();

    let second = appeals
        .submit(cleaner_appeal(&appt), &appt, at(2026, 3, 11, 12))
        .await
        .unwrap();
    appeals.start_review(second.id, reviewer(), at(2026, 3, 11, 13)).await.unwrap();
    let resolved = appeals
        .resolve(second.id, waive_penalty(), None, reviewer(), at(2026, 3, 11, 14))
        .await
        .unwrap();
    assert_eq!(resolved.status, AppealStatus::Approved);

    assert_eq!(restored_payouts(&h.engine, &appt).await, vec![Money::from_cents(13500)]);
    assert!(h.engine.totals(appt.id).await.unwrap().is_balanced());
}
