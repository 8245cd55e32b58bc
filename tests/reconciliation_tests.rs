mod common;

use chrono::NaiveDate;
use common::{CLEANER, appointment, at, harness, late_cancellation};
use homeclean_ledger::domain::ids::{AppointmentId, UserId};
use homeclean_ledger::domain::ledger::{
    Direction, EntryType, GatewayObjectRef, PartyType, ReconciliationStatus,
};
use homeclean_ledger::domain::money::Money;
use homeclean_ledger::domain::reports::ReportPeriod;
use homeclean_ledger::error::LedgerError;

async fn booking_charge(h: &common::Harness, id: AppointmentId) -> GatewayObjectRef {
    h.engine
        .entries(Some(id))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.entry_type == EntryType::BookingRevenue && e.direction == Direction::Debit)
        .and_then(|e| e.gateway_object)
        .unwrap()
}

#[tokio::test]
async fn test_clean_run_reconciles_every_object() {
    let h = harness();
    h.engine
        .process_cancellation(&late_cancellation(appointment(1)))
        .await
        .unwrap();

    let run = h.engine.reconciliation().run(at(2026, 3, 11, 0)).await.unwrap();
    // Booking charge, refund, fee charge and cleaner transfer.
    assert_eq!(run.objects_checked, 4);
    assert_eq!(run.matched, 4);
    assert_eq!(run.discrepancies, 0);
    assert!(
        h.engine
            .entries(Some(AppointmentId(1)))
            .await
            .unwrap()
            .iter()
            .filter(|e| e.gateway_object.is_some())
            .all(|e| e.reconciliation.is_reconciled())
    );

    // Reconciled objects are not checked again.
    let again = h.engine.reconciliation().run(at(2026, 3, 12, 0)).await.unwrap();
    assert_eq!(again.objects_checked, 0);
}

#[tokio::test]
async fn test_drifted_amount_is_flagged() {
    let h = harness();
    let appt = appointment(2);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let charge = booking_charge(&h, appt.id).await;
    h.gateway
        .override_amount(charge.clone(), Some(Money::from_cents(15100)))
        .await;

    let run = h.engine.reconciliation().run(at(2026, 3, 11, 0)).await.unwrap();
    assert_eq!(run.discrepancies, 1);
    assert_eq!(run.matched, 3);
    let finding = run.findings.iter().find(|f| f.object == charge).unwrap();
    assert_eq!(finding.local_amount, Money::from_cents(15000));
    assert_eq!(finding.gateway_amount, Some(Money::from_cents(15100)));
    assert_eq!(finding.discrepancy, 100);

    let booking = h
        .engine
        .entries(Some(appt.id))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.entry_type == EntryType::BookingRevenue)
        .unwrap();
    assert_eq!(booking.amount, Money::from_cents(15000));
    assert!(matches!(
        booking.reconciliation,
        ReconciliationStatus::Discrepancy { amount: 100, .. }
    ));

    let report = h
        .engine
        .reconciliation()
        .reconciliation_report(ReportPeriod::DateRange {
            from: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(report.unreconciled.len(), 1);
    assert_eq!(report.unreconciled[0].gateway_object, charge);
    assert_eq!(report.unreconciled[0].discrepancy, Some(100));
    assert_eq!(
        report.totals_by_type[&EntryType::BookingRevenue],
        Money::from_cents(15000)
    );

    // Still flagged on the next run until someone fixes it.
    let again = h.engine.reconciliation().run(at(2026, 3, 12, 0)).await.unwrap();
    assert_eq!(again.objects_checked, 1);
    assert_eq!(again.discrepancies, 1);
}

#[tokio::test]
async fn test_missing_gateway_record_is_a_discrepancy() {
    let h = harness();
    let appt = appointment(3);
    h.engine
        .process_cancellation(&late_cancellation(appt.clone()))
        .await
        .unwrap();
    let charge = booking_charge(&h, appt.id).await;
    h.gateway.override_amount(charge.clone(), None).await;

    let run = h.engine.reconciliation().run(at(2026, 3, 11, 0)).await.unwrap();
    let finding = run.findings.iter().find(|f| f.object == charge).unwrap();
    assert_eq!(finding.gateway_amount, None);
    assert_eq!(finding.discrepancy, -15000);
}

#[tokio::test]
async fn test_tax_report_groups_cleaner_payouts() {
    let h = harness();
    h.engine
        .process_cancellation(&late_cancellation(appointment(4)))
        .await
        .unwrap();
    h.engine
        .process_cancellation(&late_cancellation(appointment(5)))
        .await
        .unwrap();

    let report = h.engine.reconciliation().tax_report(2026, Some(1)).await.unwrap();
    assert_eq!(report.parties.len(), 1);
    let line = &report.parties[0];
    assert_eq!(line.party_type, PartyType::Cleaner);
    assert_eq!(line.party_user_id, CLEANER);
    assert_eq!(line.total, Money::from_cents(13500));
    assert_eq!(line.entry_count, 2);
    assert_eq!(
        report.by_entry_type[&EntryType::CancellationFeeRevenue],
        Money::from_cents(5000)
    );
    assert!(!report.parties.iter().any(|p| p.party_user_id == UserId(10)));

    let next_quarter = h.engine.reconciliation().tax_report(2026, Some(2)).await.unwrap();
    assert!(next_quarter.parties.is_empty());
    assert!(next_quarter.by_entry_type.is_empty());

    let whole_year = h.engine.reconciliation().tax_report(2026, None).await.unwrap();
    assert_eq!(whole_year.parties, report.parties);
}

#[tokio::test]
async fn test_tax_report_rejects_bad_quarter() {
    let h = harness();
    let err = h.engine.reconciliation().tax_report(2026, Some(5)).await.unwrap_err();
    assert!(matches!(err, LedgerError::ValidationError(_)));
}
