//! Structured logging for the server and its workers.
//!
//! ## Behavior
//!
//! - Uses `tracing-subscriber` with pretty-printed output.
//! - Pulls filtering rules from `RUST_LOG` or defaults to `info`.
//! - Includes thread ID, file, and line number for traceability.
//! - Timestamped using local time (RFC 3339 format).
//!
//! The subscriber is installed once in the primary before any worker is
//! forked, so every worker inherits it and writes to the same stdout.

use tracing_subscriber::{EnvFilter, fmt, fmt::format::FmtSpan};

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Fails if a global subscriber has already been set.
pub fn init_tracing() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_span_events(FmtSpan::NONE)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .pretty()
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
