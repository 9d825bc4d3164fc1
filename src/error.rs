use thiserror::Error;

/// Postgres SQLSTATE codes that signal a retryable transaction conflict.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Unavailable(_) => false,
            StoreError::Database(sqlx::Error::Database(err)) => matches!(
                err.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ),
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(_) => false,
        }
    }
}

/// Errors surfaced by the ledger. Business denials are not errors; they are
/// returned inside `ConsumeOutcome`, `RefundOutcome`, and `Eligibility`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{operation} requires a positive amount, got {amount}")]
    InvalidAmount {
        operation: &'static str,
        amount: i64,
    },
    #[error("granting {amount} to {tenant_id}/{resource_type} would overflow its balance")]
    BalanceOverflow {
        tenant_id: String,
        resource_type: String,
        amount: i64,
    },
    #[error("ledger invariant violated for {tenant_id}/{resource_type}: {detail}")]
    InvariantViolation {
        tenant_id: String,
        resource_type: String,
        detail: String,
    },
    #[error("{operation} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl LedgerError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, LedgerError::InvariantViolation { .. })
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
