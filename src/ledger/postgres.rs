use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::error::StoreError;

use super::models::{BalanceKey, BalanceRecord, EntryKind, HistoryQuery, LedgerEntry};
use super::store::{LedgerStore, LedgerTx};

const RECORD_COLUMNS: &str = "tenant_id, resource_type, total_granted, used, available, expired, \
     is_enabled, is_active, expires_at, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, sequence, tenant_id, resource_type, kind, amount, \
     balance_before, balance_after, reference_id, reference_kind, actor_id, metadata, created_at";

/// key: ledger-postgres-store -> balance_records + ledger_entries
/// A unit of work takes a transaction-scoped advisory lock on the pair before
/// reading its row `FOR UPDATE`, so first-grant inserts serialize too.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn pair_lock_name(key: &BalanceKey) -> String {
    format!("credit-ledger\u{1f}{}\u{1f}{}", key.tenant_id, key.resource_type)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn lock<'a>(&'a self, key: &BalanceKey) -> Result<Box<dyn LedgerTx + 'a>, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(pair_lock_name(key))
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, BalanceRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM balance_records \
             WHERE tenant_id = $1 AND resource_type = $2 FOR UPDATE"
        ))
        .bind(&key.tenant_id)
        .bind(&key.resource_type)
        .fetch_optional(&mut *tx)
        .await?;

        Ok(Box::new(PgLedgerTx {
            tx,
            key: key.clone(),
            record,
        }))
    }

    async fn record(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>, StoreError> {
        let record = sqlx::query_as::<_, BalanceRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM balance_records WHERE tenant_id = $1 AND resource_type = $2"
        ))
        .bind(&key.tenant_id)
        .bind(&key.resource_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn records(&self, tenant_id: &str) -> Result<Vec<BalanceRecord>, StoreError> {
        let records = sqlx::query_as::<_, BalanceRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM balance_records WHERE tenant_id = $1 ORDER BY resource_type"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn entry(&self, id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn entries_for(&self, key: &BalanceKey) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE tenant_id = $1 AND resource_type = $2 ORDER BY sequence ASC"
        ))
        .bind(&key.tenant_id)
        .bind(&key.resource_type)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries "));
        builder.push("WHERE tenant_id = ");
        builder.push_bind(query.tenant_id.clone());

        if let Some(resource_type) = &query.resource_type {
            builder.push(" AND resource_type = ");
            builder.push_bind(resource_type.clone());
        }

        if let Some(kind) = query.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_str());
        }

        if let Some(start) = query.start {
            builder.push(" AND created_at >= ");
            builder.push_bind(start);
        }

        if let Some(end) = query.end {
            builder.push(" AND created_at <= ");
            builder.push_bind(end);
        }

        builder.push(" ORDER BY sequence DESC LIMIT ");
        builder.push_bind(query.effective_limit());
        builder.push(" OFFSET ");
        builder.push_bind(query.effective_offset());

        let rows = builder
            .build_query_as::<LedgerEntryRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn expiry_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BalanceKey>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT tenant_id, resource_type
            FROM balance_records
            WHERE is_active
              AND available > 0
              AND expires_at IS NOT NULL
              AND expires_at < $1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(tenant_id, resource_type)| BalanceKey::new(tenant_id, resource_type))
            .collect())
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    key: BalanceKey,
    record: Option<BalanceRecord>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    fn record(&self) -> Option<&BalanceRecord> {
        self.record.as_ref()
    }

    async fn refund_of(&mut self, consume_id: Uuid) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE kind = 'refund' AND reference_id = $1"
        ))
        .bind(consume_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE tenant_id = $1 AND resource_type = $2 ORDER BY sequence ASC"
        ))
        .bind(&self.key.tenant_id)
        .bind(&self.key.resource_type)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn last_entry(&mut self) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE tenant_id = $1 AND resource_type = $2 ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(&self.key.tenant_id)
        .bind(&self.key.resource_type)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn put_record(&mut self, record: BalanceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO balance_records (
                tenant_id,
                resource_type,
                total_granted,
                used,
                available,
                expired,
                is_enabled,
                is_active,
                expires_at,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, resource_type)
            DO UPDATE SET
                total_granted = EXCLUDED.total_granted,
                used = EXCLUDED.used,
                available = EXCLUDED.available,
                expired = EXCLUDED.expired,
                is_enabled = EXCLUDED.is_enabled,
                is_active = EXCLUDED.is_active,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.resource_type)
        .bind(record.total_granted)
        .bind(record.used)
        .bind(record.available)
        .bind(record.expired)
        .bind(record.is_enabled)
        .bind(record.is_active)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;

        self.record = Some(record);
        Ok(())
    }

    async fn append(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry, StoreError> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_entries (
                id,
                tenant_id,
                resource_type,
                kind,
                amount,
                balance_before,
                balance_after,
                reference_id,
                reference_kind,
                actor_id,
                metadata,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING sequence
            "#,
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(&entry.resource_type)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(&entry.reference_id)
        .bind(&entry.reference_kind)
        .bind(&entry.actor_id)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .fetch_one(&mut *self.tx)
        .await?;

        entry.sequence = sequence;
        Ok(entry)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LedgerEntryRow {
    id: Uuid,
    sequence: i64,
    tenant_id: String,
    resource_type: String,
    kind: String,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    reference_id: Option<String>,
    reference_kind: Option<String>,
    actor_id: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        let kind = EntryKind::from_str(&row.kind).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown ledger entry kind: {}", row.kind).into(),
            ))
        })?;
        Ok(LedgerEntry {
            id: row.id,
            sequence: row.sequence,
            tenant_id: row.tenant_id,
            resource_type: row.resource_type,
            kind,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            reference_id: row.reference_id,
            reference_kind: row.reference_kind,
            actor_id: row.actor_id,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}
