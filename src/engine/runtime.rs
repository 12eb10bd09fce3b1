// src/engine/runtime.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::model::TargetDoc;
use crate::exec::{NullObserver, OutputSink, Runner, RunnerObserver};
use crate::protocol::Emitter;
use crate::watch::{
    parse_watch_patterns, scan_files, write_sums, ChangeSet, Watcher,
};

/// Advisory liveness tick.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// External control channels, used by the orchestrator for granular
/// per-target control. All senders are bounded to one slot; a trigger
/// arriving while one is pending coalesces.
pub struct Controls {
    pub build_rx: mpsc::Receiver<()>,
    pub stop_rx: mpsc::Receiver<()>,
    pub start_rx: mpsc::Receiver<()>,
}

/// Runtime options for [`run_target`].
pub struct EngineOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub build_sink: OutputSink,
    pub run_sink: OutputSink,
    /// Sum manifest file name, relative to the target root.
    pub sum_file: String,
    /// Lifecycle observer (status bookkeeping in orchestrated mode).
    pub observer: Arc<dyn RunnerObserver>,
    /// Protocol emitter for standalone runs.
    pub emitter: Option<Arc<Emitter>>,
    /// External control channels (orchestrated mode).
    pub controls: Option<Controls>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            build_sink: OutputSink::Inherit,
            run_sink: OutputSink::Inherit,
            sum_file: "watchrun.sum".to_string(),
            observer: Arc::new(NullObserver),
            emitter: None,
            controls: None,
        }
    }
}

/// Run the full watch–build–supervise loop for one target until the token
/// is cancelled.
///
/// Unrecoverable startup failures (initial scan, initial pipeline,
/// initial start) propagate out; everything after that is reflected
/// through the observer and retried on the next change or trigger.
pub async fn run_target(
    cancel: CancellationToken,
    root: PathBuf,
    doc: TargetDoc,
    opts: EngineOptions,
) -> Result<()> {
    let patterns = parse_watch_patterns(&doc.watch);

    let initial_sums = scan_files(&root, &patterns).context("initial scan")?;
    debug!(files = initial_sums.len(), "initial scan complete");

    let sum_path = root.join(&opts.sum_file);
    write_sums(&sum_path, &initial_sums).context("write sum file")?;

    let runner = Arc::new(Runner::new(
        root.clone(),
        doc.pipeline_steps(),
        doc.run_cmd().map(String::from),
        opts.build_sink.clone(),
        opts.run_sink.clone(),
        Arc::clone(&opts.observer),
        cancel.child_token(),
    ));

    let build_only = doc.is_build_only();

    // Initial pipeline, then the managed process.
    let mut initial_duration = Duration::ZERO;
    if build_only || !runner_steps_empty(&doc) {
        initial_duration = runner.run_pipeline().await.context("initial build")?;
        info!(secs = initial_duration.as_secs_f64(), "initial pipeline finished");
    }
    if !build_only {
        runner.start().context("initial start")?;
        info!(pid = runner.pid(), "process started");
        if let Some(emitter) = &opts.emitter {
            emitter.started(runner.pid(), initial_duration);
        }
    }

    // Watcher feeding debounced change sets into this loop.
    let (changes_tx, mut changes_rx) = mpsc::channel::<ChangeSet>(1);
    let watcher = Watcher::new(
        root.clone(),
        patterns.clone(),
        opts.poll_interval,
        opts.debounce,
        initial_sums,
        changes_tx,
        cancel.child_token(),
    );
    tokio::spawn(watcher.run());

    let exit_slot = runner.exit_slot();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();
    let mut healthy = true;

    let mut controls = opts.controls;
    let (mut build_rx, mut stop_rx, mut start_rx) = match controls.take() {
        Some(c) => (Some(c.build_rx), Some(c.stop_rx), Some(c.start_rx)),
        None => (None, None, None),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutting down");
                if let Some(emitter) = &opts.emitter {
                    emitter.stopping();
                }
                runner.cleanup().await;
                return Ok(());
            }

            changes = changes_rx.recv() => {
                let Some(changes) = changes else { return Ok(()) };
                info!(
                    added = changes.added.len(),
                    modified = changes.modified.len(),
                    removed = changes.removed.len(),
                    "file changes detected"
                );
                if let Some(emitter) = &opts.emitter {
                    emitter.changed(&changes);
                }

                match runner.restart().await {
                    Ok(duration) => {
                        healthy = true;
                        if build_only {
                            info!(secs = duration.as_secs_f64(), "rebuild finished");
                        } else {
                            info!(pid = runner.pid(), secs = duration.as_secs_f64(), "restarted");
                        }
                        if let Some(emitter) = &opts.emitter {
                            emitter.rebuilt(runner.pid(), duration, &changes);
                        }
                        refresh_sums(&root, &patterns, &sum_path);
                    }
                    Err(err) => {
                        healthy = false;
                        error!(error = %format!("{err:#}"), "build failed, keeping previous process");
                        if let Some(emitter) = &opts.emitter {
                            emitter.build_failed(&format!("{err:#}"), &changes);
                        }
                    }
                }
            }

            exit = exit_slot.recv() => {
                healthy = false;
                if exit.code == 0 {
                    info!("process completed, waiting for file changes");
                } else {
                    warn!(code = exit.code, "process exited, waiting for file changes");
                }
            }

            _ = recv_or_pending(build_rx.as_mut()) => {
                info!("build triggered");
                match runner.restart().await {
                    Ok(duration) => {
                        healthy = true;
                        info!(pid = runner.pid(), secs = duration.as_secs_f64(), "build done");
                        refresh_sums(&root, &patterns, &sum_path);
                    }
                    Err(err) => {
                        healthy = false;
                        error!(error = %format!("{err:#}"), "build failed");
                    }
                }
            }

            _ = recv_or_pending(stop_rx.as_mut()) => {
                if build_only {
                    debug!("stop request ignored for build-only target");
                } else {
                    info!("stopping process");
                    runner.stop().await;
                }
            }

            _ = recv_or_pending(start_rx.as_mut()) => {
                if build_only {
                    debug!("start request ignored for build-only target");
                } else if runner.running() {
                    debug!("process already running, start request ignored");
                } else {
                    info!("starting process");
                    match runner.start() {
                        Ok(()) => info!(pid = runner.pid(), "process started"),
                        Err(err) => error!(error = %format!("{err:#}"), "start failed"),
                    }
                }
            }

            _ = heartbeat.tick() => {
                debug!(healthy, running = runner.running(), "heartbeat");
            }
        }
    }
}

fn runner_steps_empty(doc: &TargetDoc) -> bool {
    doc.pipeline_steps().is_empty()
}

/// Rescan and rewrite the persisted sum manifest after a successful
/// rebuild. Failures are informational only; the in-memory snapshot stays
/// authoritative.
fn refresh_sums(
    root: &std::path::Path,
    patterns: &[crate::watch::Pattern],
    sum_path: &std::path::Path,
) {
    match scan_files(root, patterns) {
        Ok(sums) => {
            if let Err(err) = write_sums(sum_path, &sums) {
                debug!(error = %err, "sum file update failed");
            }
        }
        Err(err) => debug!(error = %err, "post-build rescan failed"),
    }
}

/// Receive from an optional control channel; absent or closed channels
/// never yield.
async fn recv_or_pending(rx: Option<&mut mpsc::Receiver<()>>) {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(()) => {}
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
