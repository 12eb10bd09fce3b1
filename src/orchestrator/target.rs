// src/orchestrator/target.rs

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::loader::{load_target_config, sum_file_name};
use crate::config::model::{Link, TargetEntry};
use crate::config::template::VarMap;
use crate::engine::{run_target, Controls, EngineOptions};
use crate::exec::{OutputSink, RunnerObserver};

/// Lifecycle state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Idle,
    Starting,
    Running,
    Stopped,
    Exited,
    Error,
}

/// JSON-serializable snapshot of a target's status.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: TargetState,
    pub enabled: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exec_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exec_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_exec_result: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_exec_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start_time: Option<DateTime<Utc>>,
    pub restart_count: u64,
    pub build_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[derive(Debug)]
struct TargetInner {
    state: TargetState,
    enabled: bool,
    build_only: bool,
    pid: u32,
    cancel: Option<CancellationToken>,
    build_tx: Option<mpsc::Sender<()>>,
    stop_tx: Option<mpsc::Sender<()>>,
    start_tx: Option<mpsc::Sender<()>>,
    last_exec_time: Option<DateTime<Utc>>,
    last_exec_duration_secs: Option<f64>,
    last_exec_result: String,
    last_exec_error: String,
    last_start_time: Option<DateTime<Utc>>,
    restart_count: u64,
    build_count: u64,
}

/// A named unit of work: one root directory, one watch/build/exec config,
/// one engine loop. All status mutation goes through the shared inner
/// state under its mutex; reads are snapshots.
pub struct Target {
    name: String,
    entry: TargetEntry,
    root: PathBuf,
    config_file: PathBuf,
    parent_vars: VarMap,
    parent_cancel: CancellationToken,
    tracker: TaskTracker,
    inner: Arc<Mutex<TargetInner>>,
}

impl Target {
    pub fn new(
        name: String,
        entry: TargetEntry,
        base_dir: &Path,
        parent_vars: VarMap,
        parent_cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let config_file = {
            let p = PathBuf::from(&entry.config);
            if p.is_absolute() {
                p
            } else {
                base_dir.join(p)
            }
        };
        let root = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base_dir.to_path_buf());

        let enabled = entry.is_enabled();
        Self {
            name,
            entry,
            root,
            config_file,
            parent_vars,
            parent_cancel,
            tracker,
            inner: Arc::new(Mutex::new(TargetInner {
                state: TargetState::Idle,
                enabled,
                build_only: false,
                pid: 0,
                cancel: None,
                build_tx: None,
                stop_tx: None,
                start_tx: None,
                last_exec_time: None,
                last_exec_duration_secs: None,
                last_exec_result: String::new(),
                last_exec_error: String::new(),
                last_start_time: None,
                restart_count: 0,
                build_count: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Per-stage log paths, when a logs directory is configured.
    pub fn log_paths(&self) -> Option<crate::config::model::LogPaths> {
        self.entry.logs.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TargetInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load this target's config and launch its engine loop.
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if matches!(inner.state, TargetState::Running | TargetState::Starting) {
                bail!("target {:?} is already running", self.name);
            }
            inner.state = TargetState::Starting;
        }

        let (doc, _vars) = match load_target_config(&self.config_file, &self.parent_vars)
        {
            Ok(v) => v,
            Err(err) => {
                let mut inner = self.lock();
                inner.state = TargetState::Error;
                inner.last_exec_error = format!("{err:#}");
                return Err(err.context(format!("target {:?}: load config", self.name)));
            }
        };
        let build_only = doc.is_build_only();

        let (build_sink, run_sink) = match self.open_log_sinks() {
            Ok(sinks) => sinks,
            Err(err) => {
                let mut inner = self.lock();
                inner.state = TargetState::Error;
                inner.last_exec_error = format!("{err:#}");
                return Err(err);
            }
        };

        let cancel = self.parent_cancel.child_token();
        let (build_tx, build_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (start_tx, start_rx) = mpsc::channel(1);

        {
            let mut inner = self.lock();
            inner.build_only = build_only;
            inner.cancel = Some(cancel.clone());
            inner.build_tx = Some(build_tx);
            inner.stop_tx = Some(stop_tx);
            inner.start_tx = Some(start_tx);
        }

        let opts = EngineOptions {
            build_sink,
            run_sink,
            sum_file: sum_file_name(&self.config_file),
            observer: Arc::new(StatusObserver {
                inner: Arc::clone(&self.inner),
                build_only,
            }),
            controls: Some(Controls {
                build_rx,
                stop_rx,
                start_rx,
            }),
            ..EngineOptions::default()
        };

        let name = self.name.clone();
        let root = self.root.clone();
        let inner = Arc::clone(&self.inner);
        let run_cancel = cancel.clone();
        self.tracker.spawn(async move {
            let result = run_target(run_cancel.clone(), root, doc, opts).await;

            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            if run_cancel.is_cancelled() {
                if inner.state != TargetState::Stopped {
                    inner.state = TargetState::Stopped;
                }
            } else if let Err(err) = result {
                error!(name = %name, error = %format!("{err:#}"), "target loop failed");
                inner.state = TargetState::Error;
                inner.last_exec_error = format!("{err:#}");
            }
            inner.pid = 0;
            inner.build_tx = None;
            inner.stop_tx = None;
            inner.start_tx = None;
        });

        info!(name = %self.name, root = %self.root.display(), "target started");
        Ok(())
    }

    fn open_log_sinks(&self) -> Result<(OutputSink, OutputSink)> {
        let Some(logs) = &self.entry.logs else {
            return Ok((OutputSink::Inherit, OutputSink::Inherit));
        };
        let open = |path: &Path| -> Result<OutputSink> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log {}", path.display()))?;
            Ok(OutputSink::File(Arc::new(file)))
        };
        Ok((open(&logs.build)?, open(&logs.run)?))
    }

    /// Request a rebuild + restart. Coalesces: a trigger arriving while
    /// one is already pending is dropped.
    pub fn build(&self) {
        if let Some(tx) = &self.lock().build_tx {
            if tx.try_send(()).is_err() {
                debug!(name = %self.name, "build trigger already pending");
            }
        }
    }

    /// Start just the managed process (no rebuild).
    pub fn start_exec(&self) {
        if let Some(tx) = &self.lock().start_tx {
            let _ = tx.try_send(());
        }
    }

    /// Stop just the managed process; the watcher keeps running.
    pub fn stop_exec(&self) {
        let mut inner = self.lock();
        if let Some(tx) = &inner.stop_tx {
            if tx.try_send(()).is_ok() && !inner.build_only {
                inner.state = TargetState::Stopped;
                inner.pid = 0;
            }
        }
    }

    /// Cancel the engine loop; the runner shuts the process group down
    /// gracefully (SIGTERM, 5 s grace, SIGKILL).
    pub fn stop(&self) {
        let cancel = {
            let mut inner = self.lock();
            inner.state = TargetState::Stopped;
            inner.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Cancel the engine loop and SIGKILL the recorded process group
    /// immediately, no grace.
    pub fn kill(&self) {
        let (cancel, pid) = {
            let mut inner = self.lock();
            inner.state = TargetState::Stopped;
            (inner.cancel.take(), std::mem::take(&mut inner.pid))
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        #[cfg(unix)]
        if pid > 0 {
            unsafe {
                let pgid = libc::getpgid(pid as i32);
                let target = if pgid > 0 { -pgid } else { pid as i32 };
                libc::kill(target, libc::SIGKILL);
            }
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> TargetStatus {
        let inner = self.lock();

        let links = self
            .entry
            .links
            .iter()
            .map(|l| {
                let mut link = l.clone();
                link.resolved_url = match (&l.file, &l.url) {
                    (Some(file), _) => {
                        Some(format!("/api/file?path={}", query_escape(file)))
                    }
                    (None, Some(url)) => Some(url.clone()),
                    (None, None) => None,
                };
                link
            })
            .collect();

        TargetStatus {
            name: self.name.clone(),
            kind: if inner.build_only {
                "build-only".to_string()
            } else {
                "build-and-run".to_string()
            },
            state: inner.state,
            enabled: inner.enabled,
            pid: inner.pid,
            last_exec_time: inner.last_exec_time,
            last_exec_duration_secs: inner.last_exec_duration_secs,
            last_exec_result: inner.last_exec_result.clone(),
            last_exec_error: inner.last_exec_error.clone(),
            last_start_time: inner.last_start_time,
            restart_count: inner.restart_count,
            build_count: inner.build_count,
            links,
        }
    }
}

/// Runner observer that mirrors lifecycle transitions into the target's
/// shared status. All callbacks only take the lock and write fields.
struct StatusObserver {
    inner: Arc<Mutex<TargetInner>>,
    build_only: bool,
}

impl RunnerObserver for StatusObserver {
    fn on_pipeline_start(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_exec_time = Some(Utc::now());
        inner.state = TargetState::Starting;
        inner.build_count += 1;
    }

    fn on_pipeline_done(&self, duration: Duration, error: Option<&str>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_exec_duration_secs = Some(duration.as_secs_f64());
        match error {
            Some(msg) => {
                inner.last_exec_result = "failed".to_string();
                inner.last_exec_error = msg.to_string();
                inner.state = TargetState::Error;
            }
            None => {
                inner.last_exec_result = "success".to_string();
                inner.last_exec_error.clear();
                if self.build_only {
                    inner.state = TargetState::Exited;
                }
            }
        }
    }

    fn on_process_start(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pid = pid;
        if inner.last_start_time.is_some() {
            inner.restart_count += 1;
        }
        inner.last_start_time = Some(Utc::now());
        inner.state = TargetState::Running;
    }

    fn on_process_exit(&self, code: i32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pid = 0;
        inner.state = if code == 0 {
            TargetState::Exited
        } else {
            TargetState::Error
        };
    }
}

/// Minimal percent-encoding for query string values.
fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
