use crate::domain::appeal::Appeal;
use crate::domain::audit::AuditEvent;
use crate::domain::ids::AppointmentId;
use crate::domain::ledger::{
    LedgerEntry, LedgerTotals, PendingPosting, PostOutcome, PostingPair, ReconciliationStatus,
};
use crate::domain::ports::{AppealStore, AuditStore, LedgerStore};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    /// Insertion order.
    entries: Vec<LedgerEntry>,
    /// Idempotency key -> positions of the debit and credit entries.
    by_key: HashMap<String, (usize, usize)>,
    /// Gateway key -> idempotency key.
    by_gateway: HashMap<String, String>,
    pending: BTreeMap<String, PendingPosting>,
}

impl LedgerState {
    fn pair_at(&self, (debit, credit): (usize, usize)) -> PostingPair {
        PostingPair {
            debit: self.entries[debit].clone(),
            credit: self.entries[credit].clone(),
        }
    }

    fn existing(&self, pair: &PostingPair) -> Option<PostingPair> {
        if let Some(pos) = self.by_key.get(pair.idempotency_key()) {
            return Some(self.pair_at(*pos));
        }
        pair.gateway_key()
            .and_then(|gk| self.by_gateway.get(&gk))
            .and_then(|key| self.by_key.get(key))
            .map(|pos| self.pair_at(*pos))
    }
}

/// A thread-safe in-memory ledger.
///
/// Every post takes the write lock, so the duplicate check, the balance check
/// and the insert happen as one step.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a single entry with no checks at all. Only useful for simulating
    /// a ledger that was corrupted outside this service.
    pub async fn insert_unchecked(&self, entry: LedgerEntry) {
        self.state.write().await.entries.push(entry);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn post_pair(&self, pair: PostingPair) -> Result<PostOutcome> {
        let mut state = self.state.write().await;
        if let Some(original) = state.existing(&pair) {
            return Ok(PostOutcome::Duplicate(original));
        }

        let appointment_id = pair.appointment_id();
        LedgerTotals::from_entries(
            state
                .entries
                .iter()
                .filter(|e| e.appointment_id == appointment_id),
        )
        .admit(&pair)?;

        let debit_pos = state.entries.len();
        let key = pair.idempotency_key().to_string();
        if let Some(gateway_key) = pair.gateway_key() {
            state.by_gateway.insert(gateway_key, key.clone());
        }
        state.by_key.insert(key, (debit_pos, debit_pos + 1));
        state.entries.push(pair.debit.clone());
        state.entries.push(pair.credit.clone());
        Ok(PostOutcome::Inserted(pair))
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<PostingPair>> {
        let state = self.state.read().await;
        Ok(state.by_key.get(idempotency_key).map(|pos| state.pair_at(*pos)))
    }

    async fn entries_for_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.appointment_id == appointment_id)
            .cloned()
            .collect())
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.state.read().await.entries.clone())
    }

    async fn mark_reconciliation(
        &self,
        entry_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| LedgerError::NotFound(format!("ledger entry {entry_id}")))?;
        entry.reconciliation = status;
        Ok(())
    }

    async fn record_pending(&self, pending: PendingPosting) -> Result<()> {
        let mut state = self.state.write().await;
        state.pending.insert(pending.idempotency_key.clone(), pending);
        Ok(())
    }

    async fn pending_postings(&self) -> Result<Vec<PendingPosting>> {
        Ok(self.state.read().await.pending.values().cloned().collect())
    }

    async fn clear_pending(&self, idempotency_key: &str) -> Result<()> {
        self.state.write().await.pending.remove(idempotency_key);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAppealStore {
    appeals: Arc<RwLock<HashMap<Uuid, Appeal>>>,
}

impl InMemoryAppealStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppealStore for InMemoryAppealStore {
    async fn store(&self, appeal: Appeal) -> Result<()> {
        self.appeals.write().await.insert(appeal.id, appeal);
        Ok(())
    }

    async fn get(&self, appeal_id: Uuid) -> Result<Option<Appeal>> {
        Ok(self.appeals.read().await.get(&appeal_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Appeal>> {
        let mut appeals: Vec<Appeal> = self.appeals.read().await.values().cloned().collect();
        appeals.sort_by_key(|a| (a.submitted_at, a.id));
        Ok(appeals)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAuditStore {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<AuditEvent>> {
        let mut events = self.events.read().await.clone();
        // Stable sort keeps insertion order for equal timestamps.
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }
}
