// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::loader::{
    load_orchestrator_config, load_target_config, resolve_yaml_path, sum_file_name,
};
use crate::config::template::VarMap;
use crate::engine::{run_target, EngineOptions};
use crate::orchestrator::{api, Orchestrator};
use crate::protocol::Emitter;
use crate::watch::{parse_watch_patterns, scan_files, write_sums};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command.clone() {
        None | Some(Command::Serve) => run_serve(&args).await,
        Some(Command::Watch {
            config,
            tag,
            poll,
            debounce,
        }) => run_watch(&config, &tag, poll, debounce).await,
        Some(Command::Sum) => run_sum(&args),
        Some(Command::Vars) => run_vars(&args),
    }
}

/// Run the orchestrator: start all enabled (or filtered) targets and
/// serve the HTTP control API until Ctrl-C.
async fn run_serve(args: &CliArgs) -> Result<()> {
    let config_path = resolve_yaml_path(Path::new(&args.config));
    let loaded = load_orchestrator_config(&config_path)?;

    let cancel = CancellationToken::new();
    let orch = Arc::new(Orchestrator::new(loaded, cancel.clone())?);

    orch.start_targets_filtered(&args.target);

    // Ctrl-C triggers a graceful stop of every target.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for Ctrl-C");
                return;
            }
            info!("interrupt received, shutting down");
            cancel.cancel();
        });
    }

    api::serve(Arc::clone(&orch), cancel.clone()).await?;

    // The API has shut down; wait for target loops to stop their process
    // groups (SIGTERM, grace, SIGKILL).
    orch.shutdown().await;
    Ok(())
}

/// Run a single target standalone, emitting protocol lines on stdout.
async fn run_watch(config: &str, tag: &str, poll_ms: u64, debounce_ms: u64) -> Result<()> {
    let config_path = resolve_yaml_path(Path::new(config));
    let (doc, _vars) = load_target_config(&config_path, &VarMap::new())?;

    let root = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let root = root.canonicalize().unwrap_or(root);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let opts = EngineOptions {
        poll_interval: Duration::from_millis(poll_ms),
        debounce: Duration::from_millis(debounce_ms),
        sum_file: sum_file_name(&config_path),
        emitter: Some(Arc::new(Emitter::stdout(tag))),
        ..EngineOptions::default()
    };

    run_target(cancel, root, doc, opts).await
}

/// Write sum manifests for all (or selected) targets and exit.
fn run_sum(args: &CliArgs) -> Result<()> {
    let config_path = resolve_yaml_path(Path::new(&args.config));
    let loaded = load_orchestrator_config(&config_path)?;

    for (name, entry) in &loaded.doc.targets {
        if !args.target.is_empty() && !args.target.contains(name) {
            continue;
        }

        let target_config = loaded.base_dir.join(&entry.config);
        let parent_vars = loaded
            .target_vars
            .get(name)
            .cloned()
            .unwrap_or_default();
        let (doc, _) = load_target_config(&target_config, &parent_vars)
            .with_context(|| format!("target {name:?}"))?;

        let root = target_config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| loaded.base_dir.clone());
        let patterns = parse_watch_patterns(&doc.watch);
        let sums = scan_files(&root, &patterns)
            .with_context(|| format!("target {name:?}: scan"))?;

        let sum_path = root.join(sum_file_name(&target_config));
        write_sums(&sum_path, &sums)
            .with_context(|| format!("target {name:?}: write sum file"))?;
        println!("{name}: {} files -> {}", sums.len(), sum_path.display());
    }

    Ok(())
}

/// Print resolved template variables and exit.
fn run_vars(args: &CliArgs) -> Result<()> {
    let config_path = resolve_yaml_path(Path::new(&args.config));
    let loaded = load_orchestrator_config(&config_path)?;

    println!("global:");
    for (k, v) in &loaded.resolved_vars {
        println!("  {k}={v}");
    }

    for (name, vars) in &loaded.target_vars {
        if !args.target.is_empty() && !args.target.contains(name) {
            continue;
        }
        println!("{name}:");
        for (k, v) in vars {
            println!("  {k}={v}");
        }
    }

    Ok(())
}
