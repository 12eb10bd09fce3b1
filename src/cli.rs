// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `watchrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "watchrun",
    version,
    about = "Watch source trees, re-run build pipelines, and supervise processes.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the orchestrator config file.
    #[arg(
        long,
        short = 'c',
        value_name = "PATH",
        default_value = "watchrun.yaml",
        global = true
    )]
    pub config: String,

    /// Target name filter (repeatable).
    #[arg(long, short = 't', value_name = "NAME", global = true)]
    pub target: Vec<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WATCHRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run all configured targets and serve the HTTP control API.
    ///
    /// This is the default when no subcommand is given.
    Serve,

    /// Run a single target standalone, emitting structured protocol
    /// lines on stdout.
    Watch {
        /// Path to the target config file.
        #[arg(value_name = "PATH", default_value = "run.yaml")]
        config: String,

        /// Tag used in protocol lines (`[<tag>:<event>] ...`).
        #[arg(long, value_name = "TAG", default_value = "watchrun")]
        tag: String,

        /// Poll interval in milliseconds.
        #[arg(long, value_name = "MS", default_value_t = 500)]
        poll: u64,

        /// Debounce window in milliseconds.
        #[arg(long, value_name = "MS", default_value_t = 300)]
        debounce: u64,
    },

    /// Write sum manifests for all (or selected) targets and exit.
    Sum,

    /// Print resolved template variables and exit.
    Vars,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
