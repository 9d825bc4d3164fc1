use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

use super::models::{BalanceKey, BalanceRecord, HistoryQuery, LedgerEntry};

/// key: ledger-store -> repository seam for balances and the entry log
/// Reads outside a unit of work are snapshots; every mutation goes through
/// `lock`, which serializes all writers of one (tenant, resource type) pair.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a unit of work holding the exclusive lock for `key`. The lock is
    /// released on commit or when the returned value is dropped; dropping
    /// without commit discards every staged write.
    async fn lock<'a>(&'a self, key: &BalanceKey) -> Result<Box<dyn LedgerTx + 'a>, StoreError>;

    async fn record(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>, StoreError>;

    async fn records(&self, tenant_id: &str) -> Result<Vec<BalanceRecord>, StoreError>;

    async fn entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    /// Entries for one pair in commit order.
    async fn entries_for(&self, key: &BalanceKey) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Filtered tenant history, newest first, paged.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Pairs whose deadline passed with credits still available on an active record.
    async fn expiry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BalanceKey>, StoreError>;
}

/// key: ledger-unit-of-work -> balance mutation plus its log entries
#[async_trait]
pub trait LedgerTx: Send {
    /// The pair's record as read under the lock, reflecting staged writes.
    fn record(&self) -> Option<&BalanceRecord>;

    /// REFUND entry already reversing `consume_id`, if one is committed.
    async fn refund_of(&mut self, consume_id: Uuid) -> Result<Option<LedgerEntry>, StoreError>;

    /// The pair's full log in commit order, staged entries last.
    async fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Sequence-ordered tail of the pair's log; `None` when the log is empty.
    async fn last_entry(&mut self) -> Result<Option<LedgerEntry>, StoreError>;

    async fn put_record(&mut self, record: BalanceRecord) -> Result<(), StoreError>;

    /// Stages an entry and returns it with its assigned sequence.
    async fn append(&mut self, entry: LedgerEntry) -> Result<LedgerEntry, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
