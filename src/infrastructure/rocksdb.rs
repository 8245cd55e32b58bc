use crate::domain::appeal::Appeal;
use crate::domain::audit::AuditEvent;
use crate::domain::ids::AppointmentId;
use crate::domain::ledger::{
    LedgerEntry, LedgerTotals, PendingPosting, PostOutcome, PostingPair, ReconciliationStatus,
};
use crate::domain::ports::{AppealStore, AuditStore, LedgerStore};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Ledger entries, keyed by appointment id then sequence so one appointment is a
/// contiguous, insertion-ordered range.
pub const CF_LEDGER_ENTRIES: &str = "ledger_entries";
/// Secondary indexes: idempotency key, gateway key and entry id.
pub const CF_LEDGER_KEYS: &str = "ledger_keys";
pub const CF_APPEALS: &str = "appeals";
/// Audit events, keyed by insertion sequence.
pub const CF_AUDIT_EVENTS: &str = "audit_events";
pub const CF_PENDING_POSTINGS: &str = "pending_postings";

const ALL_CFS: [&str; 5] = [
    CF_LEDGER_ENTRIES,
    CF_LEDGER_KEYS,
    CF_APPEALS,
    CF_AUDIT_EVENTS,
    CF_PENDING_POSTINGS,
];

type EntryKey = [u8; 16];

fn entry_key(appointment_id: AppointmentId, seq: u64) -> EntryKey {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&appointment_id.0.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Reads the big-endian sequence stored at `key[offset..offset + 8]`.
fn seq_at(key: &[u8], offset: usize) -> u64 {
    key.get(offset..offset + 8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn idempotency_index(key: &str) -> Vec<u8> {
    format!("key:{key}").into_bytes()
}

fn gateway_index(key: &str) -> Vec<u8> {
    format!("gw:{key}").into_bytes()
}

fn id_index(id: Uuid) -> Vec<u8> {
    format!("id:{id}").into_bytes()
}

/// A persistent store implementation using RocksDB.
///
/// Every ledger post is one `WriteBatch` (both entries plus their indexes),
/// taken under a writer mutex so the duplicate and balance checks see a
/// consistent view. `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<u64>>,
    audit_seq: Arc<AtomicU64>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating any missing column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(0)),
            audit_seq: Arc::new(AtomicU64::new(0)),
        };
        let entry_seq = store.last_seq(CF_LEDGER_ENTRIES, 8)?;
        let audit_seq = store.last_seq(CF_AUDIT_EVENTS, 0)?;
        store.audit_seq.store(audit_seq, Ordering::SeqCst);
        Ok(Self {
            writer: Arc::new(Mutex::new(entry_seq)),
            ..store
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::internal(format!("{name} column family not found")))
    }

    fn last_seq(&self, name: &str, offset: usize) -> Result<u64> {
        let mut last = 0;
        for item in self.db.iterator_cf(self.cf(name)?, IteratorMode::Start) {
            let (key, _) = item?;
            last = last.max(seq_at(&key, offset));
        }
        Ok(last)
    }

    fn entry(&self, key: &[u8]) -> Result<LedgerEntry> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_LEDGER_ENTRIES)?, key)?
            .ok_or_else(|| LedgerError::internal("ledger index points at a missing entry"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn pair_for_key(&self, idempotency_key: &str) -> Result<Option<PostingPair>> {
        let keys = self.cf(CF_LEDGER_KEYS)?;
        let Some(both) = self.db.get_cf(keys, idempotency_index(idempotency_key))? else {
            return Ok(None);
        };
        if both.len() != 32 {
            return Err(LedgerError::internal("corrupt idempotency index"));
        }
        Ok(Some(PostingPair {
            debit: self.entry(&both[..16])?,
            credit: self.entry(&both[16..])?,
        }))
    }

    fn appointment_entries(&self, appointment_id: AppointmentId) -> Result<Vec<LedgerEntry>> {
        let prefix = appointment_id.0.to_be_bytes();
        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_LEDGER_ENTRIES)?,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    fn values<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(name)?, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn post_pair(&self, pair: PostingPair) -> Result<PostOutcome> {
        let mut seq = self.writer.lock().await;

        if let Some(original) = self.pair_for_key(pair.idempotency_key())? {
            return Ok(PostOutcome::Duplicate(original));
        }
        let keys = self.cf(CF_LEDGER_KEYS)?;
        if let Some(gateway_key) = pair.gateway_key()
            && let Some(original_key) = self.db.get_cf(keys, gateway_index(&gateway_key))?
            && let Some(original) = self.pair_for_key(&String::from_utf8_lossy(&original_key))?
        {
            return Ok(PostOutcome::Duplicate(original));
        }

        LedgerTotals::from_entries(&self.appointment_entries(pair.appointment_id())?).admit(&pair)?;

        let entries_cf = self.cf(CF_LEDGER_ENTRIES)?;
        let debit_key = entry_key(pair.appointment_id(), *seq + 1);
        let credit_key = entry_key(pair.appointment_id(), *seq + 2);
        let mut batch = WriteBatch::default();
        batch.put_cf(entries_cf, debit_key, serde_json::to_vec(&pair.debit)?);
        batch.put_cf(entries_cf, credit_key, serde_json::to_vec(&pair.credit)?);
        batch.put_cf(
            keys,
            idempotency_index(pair.idempotency_key()),
            [debit_key, credit_key].concat(),
        );
        batch.put_cf(keys, id_index(pair.debit.id), debit_key);
        batch.put_cf(keys, id_index(pair.credit.id), credit_key);
        if let Some(gateway_key) = pair.gateway_key() {
            batch.put_cf(keys, gateway_index(&gateway_key), pair.idempotency_key().as_bytes());
        }
        self.db.write(batch)?;
        *seq += 2;

        Ok(PostOutcome::Inserted(pair))
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<PostingPair>> {
        self.pair_for_key(idempotency_key)
    }

    async fn entries_for_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Vec<LedgerEntry>> {
        self.appointment_entries(appointment_id)
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<(u64, LedgerEntry)> = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_LEDGER_ENTRIES)?, IteratorMode::Start)
        {
            let (key, value) = item?;
            entries.push((seq_at(&key, 8), serde_json::from_slice(&value)?));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, e)| e).collect())
    }

    async fn mark_reconciliation(
        &self,
        entry_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<()> {
        let _writer = self.writer.lock().await;
        let key = self
            .db
            .get_cf(self.cf(CF_LEDGER_KEYS)?, id_index(entry_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("ledger entry {entry_id}")))?;
        let mut entry = self.entry(&key)?;
        entry.reconciliation = status;
        self.db
            .put_cf(self.cf(CF_LEDGER_ENTRIES)?, key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    async fn record_pending(&self, pending: PendingPosting) -> Result<()> {
        self.db.put_cf(
            self.cf(CF_PENDING_POSTINGS)?,
            pending.idempotency_key.as_bytes(),
            serde_json::to_vec(&pending)?,
        )?;
        Ok(())
    }

    async fn pending_postings(&self) -> Result<Vec<PendingPosting>> {
        self.values(CF_PENDING_POSTINGS)
    }

    async fn clear_pending(&self, idempotency_key: &str) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_PENDING_POSTINGS)?, idempotency_key.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl AppealStore for RocksDBStore {
    async fn store(&self, appeal: Appeal) -> Result<()> {
        self.db.put_cf(
            self.cf(CF_APPEALS)?,
            appeal.id.as_bytes(),
            serde_json::to_vec(&appeal)?,
        )?;
        Ok(())
    }

    async fn get(&self, appeal_id: Uuid) -> Result<Option<Appeal>> {
        match self.db.get_cf(self.cf(CF_APPEALS)?, appeal_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<Appeal>> {
        let mut appeals: Vec<Appeal> = self.values(CF_APPEALS)?;
        appeals.sort_by_key(|a| (a.submitted_at, a.id));
        Ok(appeals)
    }
}

#[async_trait]
impl AuditStore for RocksDBStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        let seq = self.audit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.db.put_cf(
            self.cf(CF_AUDIT_EVENTS)?,
            seq.to_be_bytes(),
            serde_json::to_vec(&event)?,
        )?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self.values(CF_AUDIT_EVENTS)?;
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }
}
