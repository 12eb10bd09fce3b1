// src/logging.rs

//! Logging setup for `watchrun` using `tracing` + `tracing-subscriber`.
//!
//! Diagnostics always go to stderr: in standalone watch mode stdout
//! carries the structured protocol lines, and in orchestrated mode child
//! process output flows through the per-target log sinks, so stdout must
//! stay clean in both.
//!
//! Level selection: a `--log-level` flag wins; otherwise `WATCHRUN_LOG`
//! is read as a full filter spec (so per-module directives like
//! `info,watchrun::watch=debug` work); otherwise `info`.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

/// Initialise the global logging subscriber.
///
/// Call once at startup; a second call panics inside `init()`.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match cli_level {
        Some(lvl) => EnvFilter::new(level_directive(lvl)),
        None => EnvFilter::try_from_env("WATCHRUN_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    Ok(())
}

fn level_directive(lvl: LogLevel) -> &'static str {
    match lvl {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
