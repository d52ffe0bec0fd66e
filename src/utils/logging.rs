//! Logging macros gated by a module-level `ENABLE_LOGS` flag.
//!
//! The ingestion hot path (device reader, persistence queue) can be silenced
//! module by module without touching `RUST_LOG`:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_error, log_info, log_warn};
//!
//! log_warn!("sample for {} dropped", channel_id);
//! ```

/// Info-level logging, compiled out of the call site when `ENABLE_LOGS` is false.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Debug-level logging for per-line chatter (decode failures, admitted samples).
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Warn-level logging, same gating as [`log_info!`].
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Error-level logging, same gating as [`log_info!`].
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
