//! Logging for the room feed client.
//!
//! The `log_*!` macros format eagerly and forward to `tracing` under the
//! `roomfeed_client` target, so a host application picks them up with
//! whatever subscriber it installs. [`init_tracing`] installs a plain fmt
//! subscriber for binaries and tests that have none.

use tracing_subscriber::EnvFilter;

pub fn log_info_impl(msg: &str) {
    tracing::info!(target: "roomfeed_client", "{}", msg);
}

pub fn log_error_impl(msg: &str) {
    tracing::error!(target: "roomfeed_client", "{}", msg);
}

pub fn log_warn_impl(msg: &str) {
    tracing::warn!(target: "roomfeed_client", "{}", msg);
}

pub fn log_debug_impl(msg: &str) {
    tracing::debug!(target: "roomfeed_client", "{}", msg);
}

/// Install a fmt subscriber honouring `RUST_LOG`, falling back to
/// `default_filter`. Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info_impl(&format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error_impl(&format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn_impl(&format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug_impl(&format!($($arg)*))
    };
}
