use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::StoreError;

use super::models::{BalanceKey, BalanceRecord, EntryKind, HistoryQuery, LedgerEntry};
use super::store::{LedgerStore, LedgerTx};

#[derive(Debug, Default)]
struct PairSlot {
    record: Option<BalanceRecord>,
    entries: Vec<LedgerEntry>,
}

/// key: ledger-memory-store -> in-process store, one async mutex per pair
/// Writers of different pairs never contend; the DashMap shard lock is only
/// held while looking up a slot, never across an await.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    pairs: DashMap<BalanceKey, Arc<Mutex<PairSlot>>>,
    entry_index: DashMap<Uuid, BalanceKey>,
    refunds: DashMap<Uuid, Uuid>,
    sequence: AtomicI64,
    injected_conflicts: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a transient conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// While set, every commit fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrites a balance record without a ledger entry. Only useful to
    /// simulate corruption when exercising reconciliation.
    pub async fn tamper_record(&self, record: BalanceRecord) {
        let slot = self.slot(&record.key());
        slot.lock().await.record = Some(record);
    }

    fn slot(&self, key: &BalanceKey) -> Arc<Mutex<PairSlot>> {
        self.pairs.entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &BalanceKey) -> Option<Arc<Mutex<PairSlot>>> {
        self.pairs.get(key).map(|slot| slot.clone())
    }

    fn tenant_slots(&self, tenant_id: &str) -> Vec<Arc<Mutex<PairSlot>>> {
        self.pairs
            .iter()
            .filter(|pair| pair.key().tenant_id == tenant_id)
            .map(|pair| pair.value().clone())
            .collect()
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<PairSlot>>> {
        self.pairs.iter().map(|pair| pair.value().clone()).collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn lock<'a>(&'a self, key: &BalanceKey) -> Result<Box<dyn LedgerTx + 'a>, StoreError> {
        let slot = self.slot(key);
        let guard = slot.clone().lock_owned().await;
        let record = guard.record.clone();
        Ok(Box::new(MemoryTx {
            store: self,
            key: key.clone(),
            slot,
            guard,
            record,
            staged: Vec::new(),
        }))
    }

    async fn record(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>, StoreError> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(None);
        };
        let record = slot.lock().await.record.clone();
        Ok(record)
    }

    async fn records(&self, tenant_id: &str) -> Result<Vec<BalanceRecord>, StoreError> {
        let mut records = Vec::new();
        for slot in self.tenant_slots(tenant_id) {
            if let Some(record) = slot.lock().await.record.clone() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
        Ok(records)
    }

    async fn entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let Some(key) = self.entry_index.get(&id).map(|key| key.clone()) else {
            return Ok(None);
        };
        let Some(slot) = self.existing_slot(&key) else {
            return Ok(None);
        };
        let found = slot
            .lock()
            .await
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .cloned();
        Ok(found)
    }

    async fn entries_for(&self, key: &BalanceKey) -> Result<Vec<LedgerEntry>, StoreError> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(Vec::new());
        };
        let entries = slot.lock().await.entries.clone();
        Ok(entries)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut matched = Vec::new();
        for slot in self.tenant_slots(&query.tenant_id) {
            let slot = slot.lock().await;
            matched.extend(
                slot.entries
                    .iter()
                    .filter(|entry| query.matches(entry))
                    .cloned(),
            );
        }
        matched.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(matched
            .into_iter()
            .skip(query.effective_offset() as usize)
            .take(query.effective_limit() as usize)
            .collect())
    }

    async fn expiry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BalanceKey>, StoreError> {
        let mut keys = Vec::new();
        for slot in self.all_slots() {
            let slot = slot.lock().await;
            if let Some(record) = &slot.record {
                if record.is_active && record.available > 0 && record.is_expired(now) {
                    keys.push(record.key());
                }
            }
        }
        Ok(keys)
    }
}

struct MemoryTx<'a> {
    store: &'a MemoryLedgerStore,
    key: BalanceKey,
    slot: Arc<Mutex<PairSlot>>,
    guard: OwnedMutexGuard<PairSlot>,
    record: Option<BalanceRecord>,
    staged: Vec<LedgerEntry>,
}

impl Drop for MemoryTx<'_> {
    // Slots of pairs with no record and no entries are forgotten. Clones are
    // only taken under the shard lock held by `remove_if`; a count of three
    // (map, `slot`, `guard`) means no other task holds or awaits this slot.
    fn drop(&mut self) {
        if self.guard.record.is_some() || !self.guard.entries.is_empty() {
            return;
        }
        let slot = &self.slot;
        self.store.pairs.remove_if(&self.key, |_, current| {
            Arc::ptr_eq(current, slot) && Arc::strong_count(current) == 3
        });
    }
}

#[async_trait]
impl<'a> LedgerTx for MemoryTx<'a> {
    fn record(&self) -> Option<&BalanceRecord> {
        self.record.as_ref()
    }

    async fn refund_of(&mut self, consume_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let reference = consume_id.to_string();
        if let Some(staged) = self.staged.iter().find(|entry| {
            entry.kind == EntryKind::Refund
                && entry.reference_id.as_deref() == Some(reference.as_str())
        }) {
            return Ok(Some(staged.clone()));
        }
        let Some(refund_id) = self.store.refunds.get(&consume_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self
            .guard
            .entries
            .iter()
            .find(|entry| entry.id == refund_id)
            .cloned())
    }

    async fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .guard
            .entries
            .iter()
            .chain(self.staged.iter())
            .cloned()
            .collect())
    }

    async fn last_entry(&mut self) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .staged
            .last()
            .or_else(|| self.guard.entries.last())
            .cloned())
    }

    async fn put_record(&mut self, record: BalanceRecord) -> Result<(), StoreError> {
        self.record = Some(record);
        Ok(())
    }

    async fn append(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry, StoreError> {
        entry.sequence = self.store.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.staged.push(entry.clone());
        Ok(entry)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        let store = tx.store;
        if store.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        let pending = store.injected_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            store.injected_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Conflict("injected commit conflict".to_string()));
        }

        let record = tx.record.take();
        let staged = std::mem::take(&mut tx.staged);
        let key = record.as_ref().map(BalanceRecord::key);
        tx.guard.record = record;
        for entry in staged {
            if let Some(key) = &key {
                store.entry_index.insert(entry.id, key.clone());
            }
            if entry.kind == EntryKind::Refund {
                if let Some(consume_id) = entry
                    .reference_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
                {
                    store.refunds.insert(consume_id, entry.id);
                }
            }
            tx.guard.entries.push(entry);
        }
        Ok(())
    }
}
