//! Credit ledger: per-tenant, per-resource-type balances gated for resource
//! creation, with an append-only log of every balance-affecting event.

pub mod gate;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod reaper;
pub mod service;
pub mod store;

pub use memory::MemoryLedgerStore;
pub use models::{
    BalanceAudit, BalanceKey, BalanceRecord, ConsumeOutcome, ConsumeRequest, DenialReason,
    Eligibility, EntryKind, GrantRequest, HistoryQuery, LedgerEntry, RefundOutcome,
    RefundRejection,
};
pub use postgres::PgLedgerStore;
pub use reaper::{
    spawn as spawn_expiry_reaper, sweep as run_expiry_sweep, ReaperHandle, SweepReport,
    REAPER_ACTOR,
};
pub use service::LedgerService;
pub use store::{LedgerStore, LedgerTx};
