use tracing_subscriber::{fmt, EnvFilter};

/// Installs the JSON `tracing` subscriber, filtered by `RUST_LOG`.
/// Falls back to `info` when the variable is unset or unparsable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).json().try_init();
}
