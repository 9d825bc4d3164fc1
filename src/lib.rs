pub mod config;
pub mod error;
pub mod ledger;
pub mod telemetry;

pub use config::LedgerConfig;
pub use error::{LedgerError, LedgerResult, StoreError};
