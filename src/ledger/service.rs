use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};

use super::gate;
use super::models::{
    normalize_resource_type, BalanceAudit, BalanceKey, BalanceRecord, ConsumeOutcome,
    ConsumeRequest, Eligibility, EntryKind, GrantRequest, HistoryQuery, LedgerEntry,
    RefundOutcome, RefundRejection,
};
use super::store::{LedgerStore, LedgerTx};

/// `reference_kind` stamped on REFUND entries, whose reference is a ledger entry id.
pub const REFUND_REFERENCE_KIND: &str = "ledger_entry";

#[derive(Clone, Copy, Debug)]
enum Flag {
    Enabled(bool),
    Active(bool),
}

/// key: ledger-service -> single writer of balances and the entry log
/// Every mutation runs as one unit of work under the pair lock: read, guard,
/// write record, append entries, commit. Transient store conflicts are
/// retried a bounded number of times; nothing is ever half-committed.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub async fn grant(&self, request: GrantRequest) -> LedgerResult<LedgerEntry> {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                operation: "grant",
                amount: request.amount,
            });
        }
        let key = request.key();
        let request = &request;
        self.retrying("grant", &key, move || self.grant_once(request))
            .await
    }

    pub async fn consume(&self, request: ConsumeRequest) -> LedgerResult<ConsumeOutcome> {
        if request.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                operation: "consume",
                amount: request.amount,
            });
        }
        let key = request.key();
        let request = &request;
        self.retrying("consume", &key, move || self.consume_once(request))
            .await
    }

    pub async fn refund(
        &self,
        transaction_id: Uuid,
        reason: &str,
        actor_id: Option<String>,
    ) -> LedgerResult<RefundOutcome> {
        let Some(original) = self.store.entry(transaction_id).await? else {
            debug!(%transaction_id, "refund rejected: transaction not found");
            return Ok(RefundOutcome::Rejected {
                reason: RefundRejection::TransactionNotFound,
            });
        };
        if original.kind != EntryKind::Consume {
            debug!(
                %transaction_id,
                kind = original.kind.as_str(),
                "refund rejected: entry is not a consumption"
            );
            return Ok(RefundOutcome::Rejected {
                reason: RefundRejection::NotAConsumption,
            });
        }

        let key = original.key();
        let original = &original;
        let actor_id = &actor_id;
        self.retrying("refund", &key, move || {
            self.refund_once(original, reason, actor_id.clone())
        })
        .await
    }

    /// Zeroes a lapsed balance. Returns the EXPIRE entry, or `None` when the
    /// record no longer qualifies (already swept, refreshed, or inactive).
    pub async fn expire(
        &self,
        key: &BalanceKey,
        now: DateTime<Utc>,
        actor_id: Option<String>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let actor_id = &actor_id;
        self.retrying("expire", key, move || {
            self.expire_once(key, now, actor_id.clone())
        })
        .await
    }

    /// Enables exactly `resource_types` for the tenant. Every other type in the
    /// tenant's universe (the configured catalog plus any existing record) is
    /// disabled without touching its balance.
    pub async fn set_enabled<I, S>(&self, tenant_id: &str, resource_types: I) -> LedgerResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: HashSet<String> = resource_types
            .into_iter()
            .map(|resource_type| {
                let resource_type: String = resource_type.into();
                normalize_resource_type(&resource_type)
            })
            .collect();

        let mut universe: BTreeSet<String> = self.config.resource_types.iter().cloned().collect();
        universe.extend(
            self.store
                .records(tenant_id)
                .await?
                .into_iter()
                .map(|record| record.resource_type),
        );
        universe.extend(wanted.iter().cloned());

        for resource_type in universe {
            let enabled = wanted.contains(&resource_type);
            let key = &BalanceKey::new(tenant_id, resource_type);
            // Disabled types are only created on demand by `toggle_enabled`.
            self.retrying("set_enabled", key, move || {
                self.set_flag_once(key, Flag::Enabled(enabled), enabled)
            })
            .await?;
        }
        Ok(())
    }

    pub async fn toggle_enabled(
        &self,
        tenant_id: &str,
        resource_type: &str,
        is_enabled: bool,
    ) -> LedgerResult<()> {
        let key = &BalanceKey::new(tenant_id, resource_type);
        self.retrying("toggle_enabled", key, move || {
            self.set_flag_once(key, Flag::Enabled(is_enabled), true)
        })
        .await
    }

    /// Soft-disables (or revives) a record without losing its history.
    pub async fn set_active(
        &self,
        tenant_id: &str,
        resource_type: &str,
        is_active: bool,
    ) -> LedgerResult<()> {
        let key = &BalanceKey::new(tenant_id, resource_type);
        self.retrying("set_active", key, move || {
            self.set_flag_once(key, Flag::Active(is_active), true)
        })
        .await
    }

    /// Spendable balance; zero unless the record is enabled, active, and unexpired.
    pub async fn balance(&self, tenant_id: &str, resource_type: &str) -> LedgerResult<i64> {
        let key = BalanceKey::new(tenant_id, resource_type);
        let record = self.store.record(&key).await?;
        Ok(record
            .map(|record| gate::effective_available(&record, Utc::now()))
            .unwrap_or(0))
    }

    pub async fn all_balances(&self, tenant_id: &str) -> LedgerResult<Vec<BalanceRecord>> {
        Ok(self.store.records(tenant_id).await?)
    }

    pub async fn permissions(&self, tenant_id: &str) -> LedgerResult<BTreeSet<String>> {
        Ok(self
            .store
            .records(tenant_id)
            .await?
            .into_iter()
            .filter(|record| record.is_enabled && record.is_active)
            .map(|record| record.resource_type)
            .collect())
    }

    /// Advisory pre-check; `consume` re-evaluates the same guard under the lock.
    pub async fn can_create(&self, tenant_id: &str, resource_type: &str) -> LedgerResult<Eligibility> {
        let key = BalanceKey::new(tenant_id, resource_type);
        let record = self.store.record(&key).await?;
        Ok(gate::eligibility(record.as_ref(), Utc::now()))
    }

    pub async fn history(&self, query: &HistoryQuery) -> LedgerResult<Vec<LedgerEntry>> {
        if let Some(resource_type) = &query.resource_type {
            let query = HistoryQuery {
                resource_type: Some(normalize_resource_type(resource_type)),
                ..query.clone()
            };
            return Ok(self.store.history(&query).await?);
        }
        Ok(self.store.history(query).await?)
    }

    pub async fn entry(&self, transaction_id: Uuid) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.store.entry(transaction_id).await?)
    }

    /// Pairs the expiry reaper should visit at `now`.
    pub async fn expiry_candidates(&self, now: DateTime<Utc>) -> LedgerResult<Vec<BalanceKey>> {
        Ok(self.store.expiry_candidates(now).await?)
    }

    /// Full log for one pair in commit order.
    pub async fn entries_for(
        &self,
        tenant_id: &str,
        resource_type: &str,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let key = BalanceKey::new(tenant_id, resource_type);
        Ok(self.store.entries_for(&key).await?)
    }

    /// key: ledger-reconcile -> replay log against record
    /// Read-only. Divergence is reported as `InvariantViolation`, never repaired.
    pub async fn reconcile(&self, tenant_id: &str, resource_type: &str) -> LedgerResult<BalanceAudit> {
        let key = BalanceKey::new(tenant_id, resource_type);
        let mut tx = self.store.lock(&key).await?;
        let entries = tx.entries().await?;
        let record = tx.record().cloned();
        drop(tx);

        let mut running = 0_i64;
        let mut granted = 0_i64;
        let mut used = 0_i64;
        let mut expired = 0_i64;
        let mut last_sequence = i64::MIN;
        for entry in &entries {
            if let Err(detail) = entry.check_shape() {
                return Err(self.violation(&key, detail));
            }
            if entry.sequence <= last_sequence {
                return Err(self.violation(
                    &key,
                    format!("entry {} is out of commit order", entry.id),
                ));
            }
            if entry.balance_before != running {
                return Err(self.violation(
                    &key,
                    format!(
                        "entry {} opens at {} but the log stood at {}",
                        entry.id, entry.balance_before, running
                    ),
                ));
            }
            running = entry.balance_after;
            last_sequence = entry.sequence;
            let (tally, delta) = match entry.kind {
                EntryKind::Grant => (&mut granted, Some(entry.amount)),
                EntryKind::Consume | EntryKind::Refund => (&mut used, entry.amount.checked_neg()),
                EntryKind::Expire => (&mut expired, entry.amount.checked_neg()),
            };
            match delta.and_then(|delta| tally.checked_add(delta)) {
                Some(next) => *tally = next,
                None => {
                    return Err(self.violation(
                        &key,
                        format!(
                            "replaying entry {} overflows the {} tally",
                            entry.id,
                            entry.kind.as_str()
                        ),
                    ));
                }
            }
        }

        match &record {
            Some(record) => {
                if let Err(detail) = record.check_conservation() {
                    return Err(self.violation(&key, detail));
                }
                let replayed = (granted, used, running, expired);
                let stored = (
                    record.total_granted,
                    record.used,
                    record.available,
                    record.expired,
                );
                if replayed != stored {
                    return Err(self.violation(
                        &key,
                        format!(
                            "replayed (granted, used, available, expired) {replayed:?} != stored {stored:?}"
                        ),
                    ));
                }
            }
            None if !entries.is_empty() => {
                return Err(self.violation(&key, "ledger entries exist without a balance record".to_string()));
            }
            None => {}
        }

        Ok(BalanceAudit {
            key,
            entries_replayed: entries.len(),
            replayed_available: running,
            record,
        })
    }

    async fn grant_once(&self, request: &GrantRequest) -> LedgerResult<LedgerEntry> {
        let now = Utc::now();
        let key = request.key();
        let mut tx = self.store.lock(&key).await?;
        let opening = self.guard_loaded(&mut *tx, &key).await?;

        let mut record = tx
            .record()
            .cloned()
            .unwrap_or_else(|| BalanceRecord::empty(&key, now));
        let mut drafts = Vec::with_capacity(2);

        if record.is_expired(now) {
            if record.available > 0 {
                let lapsed = record.available;
                drafts.push(
                    LedgerEntry::draft(&key, EntryKind::Expire, -lapsed, lapsed, now)
                        .with_actor(request.actor_id.clone())
                        .with_metadata(json!({
                            "cause": "grant_on_lapsed_balance",
                            "expires_at": record.expires_at,
                        })),
                );
                record.expired += lapsed;
                record.available = 0;
            }
            record.expires_at = None;
        }
        if let Some(deadline) = request.expires_at {
            record.expires_at = Some(deadline);
        }

        let before = record.available;
        let (Some(total_granted), Some(available)) = (
            record.total_granted.checked_add(request.amount),
            record.available.checked_add(request.amount),
        ) else {
            warn!(
                tenant_id = %key.tenant_id,
                resource_type = %key.resource_type,
                amount = request.amount,
                total_granted = record.total_granted,
                "grant rejected: balance would overflow"
            );
            return Err(LedgerError::BalanceOverflow {
                tenant_id: key.tenant_id.clone(),
                resource_type: key.resource_type.clone(),
                amount: request.amount,
            });
        };
        record.total_granted = total_granted;
        record.available = available;
        record.updated_at = now;
        drafts.push(
            LedgerEntry::draft(&key, EntryKind::Grant, request.amount, before, now)
                .with_actor(request.actor_id.clone())
                .with_metadata(json!({ "expires_at": request.expires_at })),
        );

        let mut committed = self.commit_unit(tx, &key, opening, record, drafts).await?;
        let entry = committed.pop().ok_or_else(|| {
            self.violation(&key, "grant committed without an entry".to_string())
        })?;
        info!(
            tenant_id = %key.tenant_id,
            resource_type = %key.resource_type,
            amount = request.amount,
            balance_after = entry.balance_after,
            transaction_id = %entry.id,
            "credits granted"
        );
        Ok(entry)
    }

    async fn consume_once(&self, request: &ConsumeRequest) -> LedgerResult<ConsumeOutcome> {
        let now = Utc::now();
        let key = request.key();
        let mut tx = self.store.lock(&key).await?;
        let opening = self.guard_loaded(&mut *tx, &key).await?;

        if let Err(reason) = gate::evaluate(tx.record(), request.amount, now) {
            debug!(
                tenant_id = %key.tenant_id,
                resource_type = %key.resource_type,
                amount = request.amount,
                reason = reason.as_str(),
                "consumption denied"
            );
            return Ok(ConsumeOutcome::Denied { reason });
        }
        let Some(mut record) = tx.record().cloned() else {
            return Err(self.violation(&key, "gate passed without a balance record".to_string()));
        };

        let before = record.available;
        record.available -= request.amount;
        record.used += request.amount;
        record.updated_at = now;
        let draft = LedgerEntry::draft(&key, EntryKind::Consume, -request.amount, before, now)
            .with_reference(request.reference_id.clone(), request.reference_kind.clone())
            .with_actor(request.actor_id.clone());

        let committed = self
            .commit_unit(tx, &key, opening, record, vec![draft])
            .await?;
        let Some(entry) = committed.into_iter().next() else {
            return Err(self.violation(&key, "consumption committed without an entry".to_string()));
        };
        info!(
            tenant_id = %key.tenant_id,
            resource_type = %key.resource_type,
            amount = request.amount,
            balance_after = entry.balance_after,
            reference_id = %request.reference_id,
            transaction_id = %entry.id,
            "credits consumed"
        );
        Ok(ConsumeOutcome::Consumed {
            transaction_id: entry.id,
            balance_after: entry.balance_after,
        })
    }

    async fn refund_once(
        &self,
        original: &LedgerEntry,
        reason: &str,
        actor_id: Option<String>,
    ) -> LedgerResult<RefundOutcome> {
        let now = Utc::now();
        let key = original.key();
        let mut tx = self.store.lock(&key).await?;
        let opening = self.guard_loaded(&mut *tx, &key).await?;

        if let Some(previous) = tx.refund_of(original.id).await? {
            debug!(
                transaction_id = %original.id,
                refund_id = %previous.id,
                "refund rejected: already refunded"
            );
            return Ok(RefundOutcome::Rejected {
                reason: RefundRejection::AlreadyRefunded,
            });
        }

        let Some(mut record) = tx.record().cloned() else {
            return Err(self.violation(
                &key,
                format!("consumption {} has no balance record", original.id),
            ));
        };
        let Some(amount) = original.amount.checked_neg().filter(|amount| *amount > 0) else {
            return Err(self.violation(
                &key,
                format!("consumption {} carries amount {}", original.id, original.amount),
            ));
        };
        if record.used < amount {
            return Err(self.violation(
                &key,
                format!(
                    "refund of {} exceeds recorded usage {} for consumption {}",
                    amount, record.used, original.id
                ),
            ));
        }

        let before = record.available;
        record.available += amount;
        record.used -= amount;
        record.updated_at = now;
        let draft = LedgerEntry::draft(&key, EntryKind::Refund, amount, before, now)
            .with_reference(original.id.to_string(), REFUND_REFERENCE_KIND)
            .with_actor(actor_id)
            .with_metadata(json!({
                "reason": reason,
                "original_reference_id": original.reference_id,
                "original_reference_kind": original.reference_kind,
            }));

        let committed = self
            .commit_unit(tx, &key, opening, record, vec![draft])
            .await?;
        let Some(entry) = committed.into_iter().next() else {
            return Err(self.violation(&key, "refund committed without an entry".to_string()));
        };
        info!(
            tenant_id = %key.tenant_id,
            resource_type = %key.resource_type,
            amount,
            balance_after = entry.balance_after,
            transaction_id = %original.id,
            refund_id = %entry.id,
            "consumption refunded"
        );
        Ok(RefundOutcome::Refunded {
            refund_id: entry.id,
            balance_after: entry.balance_after,
        })
    }

    async fn expire_once(
        &self,
        key: &BalanceKey,
        now: DateTime<Utc>,
        actor_id: Option<String>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let mut tx = self.store.lock(key).await?;
        let opening = self.guard_loaded(&mut *tx, key).await?;

        let Some(mut record) = tx.record().cloned() else {
            return Ok(None);
        };
        if !record.is_active || record.available <= 0 || !record.is_expired(now) {
            return Ok(None);
        }

        let lapsed = record.available;
        record.expired += lapsed;
        record.available = 0;
        record.updated_at = now;
        let draft = LedgerEntry::draft(key, EntryKind::Expire, -lapsed, lapsed, now)
            .with_actor(actor_id)
            .with_metadata(json!({ "expires_at": record.expires_at }));

        let committed = self
            .commit_unit(tx, key, opening, record, vec![draft])
            .await?;
        let entry = committed.into_iter().next();
        if let Some(entry) = &entry {
            info!(
                tenant_id = %key.tenant_id,
                resource_type = %key.resource_type,
                amount = lapsed,
                transaction_id = %entry.id,
                "credits expired"
            );
        }
        Ok(entry)
    }

    async fn set_flag_once(
        &self,
        key: &BalanceKey,
        flag: Flag,
        create_if_missing: bool,
    ) -> LedgerResult<()> {
        let now = Utc::now();
        let mut tx = self.store.lock(key).await?;
        let opening = self.guard_loaded(&mut *tx, key).await?;

        let mut record = match tx.record().cloned() {
            Some(record) => record,
            None if create_if_missing => BalanceRecord::empty(key, now),
            None => return Ok(()),
        };
        let unchanged = match flag {
            Flag::Enabled(value) => record.is_enabled == value,
            Flag::Active(value) => record.is_active == value,
        };
        if unchanged && tx.record().is_some() {
            return Ok(());
        }
        match flag {
            Flag::Enabled(value) => record.is_enabled = value,
            Flag::Active(value) => record.is_active = value,
        }
        record.updated_at = now;

        self.commit_unit(tx, key, opening, record, Vec::new())
            .await?;
        info!(
            tenant_id = %key.tenant_id,
            resource_type = %key.resource_type,
            ?flag,
            "balance flags updated"
        );
        Ok(())
    }

    /// Checks the locked record against the tail of its log and returns the
    /// opening `available` every new entry must chain from.
    async fn guard_loaded(&self, tx: &mut (dyn LedgerTx + '_), key: &BalanceKey) -> LedgerResult<i64> {
        let opening = tx.record().map(|record| record.available).unwrap_or(0);
        if let Some(record) = tx.record() {
            if let Err(detail) = record.check_conservation() {
                return Err(self.violation(key, detail));
            }
        }
        let logged = tx
            .last_entry()
            .await?
            .map(|entry| entry.balance_after)
            .unwrap_or(0);
        if logged != opening {
            return Err(self.violation(
                key,
                format!("record holds {opening} available but the log ends at {logged}"),
            ));
        }
        Ok(opening)
    }

    /// Validates and commits one unit of work. Any violation drops `tx`,
    /// discarding every staged write.
    async fn commit_unit(
        &self,
        mut tx: Box<dyn LedgerTx + '_>,
        key: &BalanceKey,
        opening: i64,
        record: BalanceRecord,
        drafts: Vec<LedgerEntry>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        if let Err(detail) = record.check_conservation() {
            return Err(self.violation(key, detail));
        }
        let mut running = opening;
        for draft in &drafts {
            if let Err(detail) = draft.check_shape() {
                return Err(self.violation(key, detail));
            }
            if draft.balance_before != running {
                return Err(self.violation(
                    key,
                    format!(
                        "entry {} opens at {} but the log stands at {}",
                        draft.id, draft.balance_before, running
                    ),
                ));
            }
            running = draft.balance_after;
        }
        if running != record.available {
            return Err(self.violation(
                key,
                format!(
                    "log would end at {running} but the record holds {}",
                    record.available
                ),
            ));
        }

        tx.put_record(record).await?;
        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            committed.push(tx.append(draft).await?);
        }
        tx.commit().await?;
        Ok(committed)
    }

    fn violation(&self, key: &BalanceKey, detail: String) -> LedgerError {
        error!(
            tenant_id = %key.tenant_id,
            resource_type = %key.resource_type,
            %detail,
            "ledger invariant violated"
        );
        LedgerError::InvariantViolation {
            tenant_id: key.tenant_id.clone(),
            resource_type: key.resource_type.clone(),
            detail,
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &BalanceKey,
        mut attempt_once: F,
    ) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match attempt_once().await {
                Err(LedgerError::Store(err)) if err.is_transient() => {
                    if attempt > self.config.max_conflict_retries {
                        warn!(
                            operation,
                            tenant_id = %key.tenant_id,
                            resource_type = %key.resource_type,
                            attempts = attempt,
                            error = %err,
                            "ledger operation exhausted conflict retries"
                        );
                        return Err(LedgerError::RetriesExhausted {
                            operation,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(
                        operation,
                        tenant_id = %key.tenant_id,
                        resource_type = %key.resource_type,
                        attempt,
                        error = %err,
                        "transient store conflict; retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}
