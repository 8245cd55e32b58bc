mod common;

use common::{HOMEOWNER, appointment, at, harness, late_cancellation};
use homeclean_ledger::domain::appeal::Actor;
use homeclean_ledger::domain::audit::{AuditEvent, AuditEventType};
use homeclean_ledger::domain::ids::AppointmentId;
use homeclean_ledger::domain::ledger::{
    AccountType, EntryMetadata, EntryType, KeyScope, Leg, PairDraft, PartyType, PostingPair,
    idempotency_key,
};
use homeclean_ledger::domain::money::Money;
use homeclean_ledger::domain::ports::{AuditStoreRef, LedgerStoreRef};
use homeclean_ledger::infrastructure::in_memory::{InMemoryAuditStore, InMemoryLedgerStore};
use std::sync::Arc;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let ledger: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());
    let audit: AuditStoreRef = Arc::new(InMemoryAuditStore::new());
    let appointment_id = AppointmentId(1);
    let key = idempotency_key(appointment_id, EntryType::BookingRevenue, &KeyScope::Booking);

    let pair = PostingPair::new(
        PairDraft {
            appointment_id,
            entry_type: EntryType::BookingRevenue,
            amount: Money::from_cents(15000),
            debit: Leg::new(AccountType::AccountsReceivable, PartyType::Homeowner, Some(HOMEOWNER)),
            credit: Leg::platform(AccountType::Revenue),
            gateway_object: None,
            idempotency_key: key.clone(),
            effective_date: at(2026, 3, 1, 9),
            metadata: EntryMetadata::default(),
        },
        at(2026, 3, 1, 9),
    );

    // Verify Send + Sync by spawning tasks
    let ls = ledger.clone();
    let ledger_handle = tokio::spawn(async move {
        ls.post_pair(pair).await.unwrap();
        ls.find_by_key(&key).await.unwrap().unwrap()
    });

    let au = audit.clone();
    let audit_handle = tokio::spawn(async move {
        let event = AuditEvent::new(
            AuditEventType::BookingChargeSucceeded,
            Actor::system(),
            at(2026, 3, 1, 9),
        );
        au.append(event.appointment(appointment_id)).await.unwrap();
        au.get_all().await.unwrap()
    });

    let retrieved = ledger_handle.await.unwrap();
    assert_eq!(retrieved.amount(), Money::from_cents(15000));
    assert_eq!(ledger.all_entries().await.unwrap().len(), 2);

    let events = audit_handle.await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].appointment_id, Some(appointment_id));
}

#[tokio::test]
async fn test_engine_shared_across_tasks() {
    let h = harness();
    let engine = Arc::new(h.engine);

    let handles: Vec<_> = (1..=8)
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .process_cancellation(&late_cancellation(appointment(id)))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().net_cost.net_cost, Money::from_cents(10000));
    }
    assert!(engine.unbalanced_appointments().await.unwrap().is_empty());
}
