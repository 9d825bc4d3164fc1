use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Upper bound applied to `HistoryQuery::limit`.
pub const MAX_HISTORY_PAGE: i64 = 500;
pub const DEFAULT_HISTORY_PAGE: i64 = 50;

/// key: ledger-balance-key -> (tenant, resource type) lock scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub tenant_id: String,
    pub resource_type: String,
}

impl BalanceKey {
    /// The resource type is normalized; tenant ids are kept as given.
    pub fn new(tenant_id: impl Into<String>, resource_type: impl AsRef<str>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource_type: normalize_resource_type(resource_type.as_ref()),
        }
    }
}

/// Canonical spelling of a resource type: trimmed, ASCII-lowercase.
pub fn normalize_resource_type(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.resource_type)
    }
}

/// key: ledger-balance-record -> materialized balance per pair
/// Mutable cache of the ledger stream for one (tenant, resource type) pair.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceRecord {
    pub tenant_id: String,
    pub resource_type: String,
    pub total_granted: i64,
    pub used: i64,
    pub available: i64,
    /// Credits zeroed by expiry; kept so lapsed grants still balance.
    pub expired: i64,
    pub is_enabled: bool,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// Zero-balance record, enabled and active.
    pub fn empty(key: &BalanceKey, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            resource_type: key.resource_type.clone(),
            total_granted: 0,
            used: 0,
            available: 0,
            expired: 0,
            is_enabled: true,
            is_active: true,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.tenant_id.clone(), self.resource_type.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline < now)
    }

    /// `total_granted == used + available + expired`, with no negative counters.
    pub fn check_conservation(&self) -> Result<(), String> {
        if self.available < 0 {
            return Err(format!("available is negative ({})", self.available));
        }
        if self.used < 0 {
            return Err(format!("used is negative ({})", self.used));
        }
        if self.expired < 0 {
            return Err(format!("expired is negative ({})", self.expired));
        }
        let accounted = self
            .used
            .checked_add(self.available)
            .and_then(|sum| sum.checked_add(self.expired));
        if accounted != Some(self.total_granted) {
            return Err(format!(
                "total_granted {} != used {} + available {} + expired {}",
                self.total_granted, self.used, self.available, self.expired
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Grant,
    Consume,
    Refund,
    Expire,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Grant => "grant",
            EntryKind::Consume => "consume",
            EntryKind::Refund => "refund",
            EntryKind::Expire => "expire",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "grant" => Some(Self::Grant),
            "consume" => Some(Self::Consume),
            "refund" => Some(Self::Refund),
            "expire" => Some(Self::Expire),
            _ => None,
        }
    }

    /// Whether entries of this kind carry a positive amount.
    pub fn is_credit(&self) -> bool {
        matches!(self, EntryKind::Grant | EntryKind::Refund)
    }
}

/// key: ledger-entry -> append-only audit record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Commit order, assigned by the store on append.
    pub sequence: i64,
    pub tenant_id: String,
    pub resource_type: String,
    pub kind: EntryKind,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reference_id: Option<String>,
    pub reference_kind: Option<String>,
    pub actor_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.tenant_id.clone(), self.resource_type.clone())
    }

    /// Entry moving `available` from `balance_before` by `amount`.
    pub(crate) fn draft(
        key: &BalanceKey,
        kind: EntryKind,
        amount: i64,
        balance_before: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            tenant_id: key.tenant_id.clone(),
            resource_type: key.resource_type.clone(),
            kind,
            amount,
            balance_before,
            balance_after: balance_before.saturating_add(amount),
            reference_id: None,
            reference_kind: None,
            actor_id: None,
            metadata: Value::Null,
            created_at: now,
        }
    }

    pub(crate) fn with_reference(mut self, id: impl Into<String>, kind: impl Into<String>) -> Self {
        self.reference_id = Some(id.into());
        self.reference_kind = Some(kind.into());
        self
    }

    pub(crate) fn with_actor(mut self, actor_id: Option<String>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub(crate) fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Arithmetic and sign checks that hold for every entry in isolation.
    pub fn check_shape(&self) -> Result<(), String> {
        if self.balance_before.checked_add(self.amount) != Some(self.balance_after) {
            return Err(format!(
                "entry {}: balance_after {} != balance_before {} + amount {}",
                self.id, self.balance_after, self.balance_before, self.amount
            ));
        }
        let sign_ok = if self.kind.is_credit() {
            self.amount > 0
        } else {
            self.amount < 0
        };
        if !sign_ok {
            return Err(format!(
                "entry {}: {} amount has wrong sign ({})",
                self.id,
                self.kind.as_str(),
                self.amount
            ));
        }
        Ok(())
    }
}

/// Grant request; `expires_at` replaces the record's deadline when set.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GrantRequest {
    pub tenant_id: String,
    pub resource_type: String,
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub actor_id: Option<String>,
}

impl GrantRequest {
    pub fn new(tenant_id: impl Into<String>, resource_type: impl Into<String>, amount: i64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource_type: resource_type.into(),
            amount,
            ..Default::default()
        }
    }

    pub fn expires_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.tenant_id.clone(), self.resource_type.clone())
    }
}

/// Consumption request linked to the resource it pays for.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumeRequest {
    pub tenant_id: String,
    pub resource_type: String,
    pub amount: i64,
    pub reference_id: String,
    pub reference_kind: String,
    pub actor_id: Option<String>,
}

impl ConsumeRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        resource_type: impl Into<String>,
        reference_id: impl Into<String>,
        reference_kind: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource_type: resource_type.into(),
            amount: 1,
            reference_id: reference_id.into(),
            reference_kind: reference_kind.into(),
            actor_id: None,
        }
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.tenant_id.clone(), self.resource_type.clone())
    }
}

/// key: ledger-denial -> expected business failures for consume/canCreate
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DenialReason {
    NotConfigured,
    Disabled,
    Inactive,
    Expired,
    InsufficientBalance,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NotConfigured => "NotConfigured",
            DenialReason::Disabled => "Disabled",
            DenialReason::Inactive => "Inactive",
            DenialReason::Expired => "Expired",
            DenialReason::InsufficientBalance => "InsufficientBalance",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RefundRejection {
    TransactionNotFound,
    NotAConsumption,
    AlreadyRefunded,
}

impl RefundRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundRejection::TransactionNotFound => "TransactionNotFound",
            RefundRejection::NotAConsumption => "NotAConsumption",
            RefundRejection::AlreadyRefunded => "AlreadyRefunded",
        }
    }
}

impl fmt::Display for RefundRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Consumed {
        transaction_id: Uuid,
        balance_after: i64,
    },
    Denied {
        reason: DenialReason,
    },
}

impl ConsumeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConsumeOutcome::Consumed { .. })
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            ConsumeOutcome::Consumed { transaction_id, .. } => Some(*transaction_id),
            ConsumeOutcome::Denied { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            ConsumeOutcome::Consumed { .. } => None,
            ConsumeOutcome::Denied { reason } => Some(*reason),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded { refund_id: Uuid, balance_after: i64 },
    Rejected { reason: RefundRejection },
}

impl RefundOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, RefundOutcome::Refunded { .. })
    }

    pub fn rejection(&self) -> Option<RefundRejection> {
        match self {
            RefundOutcome::Refunded { .. } => None,
            RefundOutcome::Rejected { reason } => Some(*reason),
        }
    }
}

/// key: ledger-eligibility -> advisory canCreate answer
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Eligibility {
    pub can_create: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    pub available: i64,
}

/// key: ledger-history-filter
/// Filter envelope for tenant ledger history, newest entries first.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub tenant_id: String,
    pub resource_type: Option<String>,
    pub kind: Option<EntryKind>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl HistoryQuery {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_PAGE)
            .clamp(1, MAX_HISTORY_PAGE)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Filter predicate, excluding paging.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if entry.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(resource_type) = &self.resource_type {
            if &entry.resource_type != resource_type {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(start) = self.start {
            if entry.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.created_at > end {
                return false;
            }
        }
        true
    }
}

/// Result of replaying one pair's ledger against its balance record.
#[derive(Clone, Debug, Serialize)]
pub struct BalanceAudit {
    pub key: BalanceKey,
    pub entries_replayed: usize,
    pub replayed_available: i64,
    pub record: Option<BalanceRecord>,
}
