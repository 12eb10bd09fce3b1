// src/exec/runner.rs

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when stopping a process group.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How a managed process ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
}

/// Single-slot publication of spontaneous exits.
///
/// The runner's wait task publishes here when the managed process exits
/// without `stop()`/`kill()` having been called; the slot keeps at most
/// one entry (a second publish while full is dropped). The engine loop
/// awaits [`ExitSlot::recv`]; `restart()` drains any stale entry before
/// starting the replacement process.
#[derive(Debug, Default)]
pub struct ExitSlot {
    slot: Mutex<Option<ExitInfo>>,
    notify: Notify,
}

impl ExitSlot {
    fn publish(&self, info: ExitInfo) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(info);
        }
        drop(slot);
        self.notify.notify_one();
    }

    /// Discard any pending entry.
    pub fn drain(&self) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Wait for the next spontaneous exit.
    pub async fn recv(&self) -> ExitInfo {
        loop {
            if let Some(info) = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                return info;
            }
            self.notify.notified().await;
        }
    }
}

/// Where a child process's stdout/stderr goes.
#[derive(Clone)]
pub enum OutputSink {
    /// Inherit the host's stdio.
    Inherit,
    /// Append to a shared log file.
    File(Arc<File>),
    /// Discard.
    Null,
}

impl OutputSink {
    fn stdio(&self) -> Result<Stdio> {
        Ok(match self {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::File(f) => Stdio::from(f.try_clone().context("clone log handle")?),
            OutputSink::Null => Stdio::null(),
        })
    }
}

/// Lifecycle hooks fired on runner transitions. Implementations must be
/// cheap and non-blocking; they run on the runner's tasks.
pub trait RunnerObserver: Send + Sync {
    fn on_pipeline_start(&self) {}
    fn on_pipeline_done(&self, _duration: Duration, _error: Option<&str>) {}
    fn on_process_start(&self, _pid: u32) {}
    fn on_process_exit(&self, _code: i32) {}
}

/// No-op observer for standalone use and tests.
pub struct NullObserver;

impl RunnerObserver for NullObserver {}

#[derive(Default)]
struct ProcState {
    pid: Option<i32>,
    stopping: bool,
    done: Option<watch::Receiver<bool>>,
}

/// Executes a preparation pipeline and supervises the trailing managed
/// command. Owns at most one live child process at a time; every spawned
/// process (pipeline steps included) leads its own process group so
/// signals reach the whole subtree.
pub struct Runner {
    root: PathBuf,
    steps: Vec<String>,
    run_cmd: Option<String>,
    build_sink: OutputSink,
    run_sink: OutputSink,
    observer: Arc<dyn RunnerObserver>,
    cancel: CancellationToken,
    state: Arc<Mutex<ProcState>>,
    exit_slot: Arc<ExitSlot>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        steps: Vec<String>,
        run_cmd: Option<String>,
        build_sink: OutputSink,
        run_sink: OutputSink,
        observer: Arc<dyn RunnerObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root,
            steps,
            run_cmd,
            build_sink,
            run_sink,
            observer,
            cancel,
            state: Arc::new(Mutex::new(ProcState::default())),
            exit_slot: Arc::new(ExitSlot::default()),
        }
    }

    /// Shared handle to the spontaneous-exit slot.
    pub fn exit_slot(&self) -> Arc<ExitSlot> {
        Arc::clone(&self.exit_slot)
    }

    /// PID of the managed process, or 0 when nothing is running.
    pub fn pid(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pid
            .map(|p| p as u32)
            .unwrap_or(0)
    }

    pub fn running(&self) -> bool {
        self.pid() != 0
    }

    /// Run all preparation steps sequentially with the target root as the
    /// working directory. Aborts on the first non-zero exit, returning the
    /// elapsed time either way through the observer.
    pub async fn run_pipeline(&self) -> Result<Duration> {
        self.observer.on_pipeline_start();
        let start = Instant::now();

        for step in &self.steps {
            debug!(cmd = %step, "running pipeline step");
            if let Err(err) = self.run_step(step).await {
                let elapsed = start.elapsed();
                self.observer
                    .on_pipeline_done(elapsed, Some(&format!("{err:#}")));
                return Err(err);
            }
        }

        let elapsed = start.elapsed();
        self.observer.on_pipeline_done(elapsed, None);
        Ok(elapsed)
    }

    async fn run_step(&self, step: &str) -> Result<()> {
        let mut child = shell_command(step, &self.root)
            .stdin(Stdio::null())
            .stdout(self.build_sink.stdio()?)
            .stderr(self.build_sink.stdio()?)
            .spawn()
            .with_context(|| format!("spawn command {step:?}"))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("wait for command {step:?}"))?;
                if !status.success() {
                    bail!("command {step:?} failed with {status}");
                }
                Ok(())
            }
            _ = self.cancel.cancelled() => {
                terminate_child(&mut child).await;
                bail!("command {step:?} canceled");
            }
        }
    }

    /// Launch the managed command in its own process group. Stdin comes
    /// from the host; stdout/stderr go to the run sinks. A background task
    /// waits on the process and publishes spontaneous exits.
    pub fn start(&self) -> Result<()> {
        let Some(run_cmd) = self.run_cmd.clone() else {
            bail!("no managed command configured");
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopping = false;

        let mut child = shell_command(&run_cmd, &self.root)
            .stdin(Stdio::inherit())
            .stdout(self.run_sink.stdio()?)
            .stderr(self.run_sink.stdio()?)
            .spawn()
            .with_context(|| format!("start {run_cmd:?}"))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let (done_tx, done_rx) = watch::channel(false);
        state.pid = Some(pid);
        state.done = Some(done_rx);
        drop(state);

        self.observer.on_process_start(pid as u32);

        let observer = Arc::clone(&self.observer);
        let exit_slot = Arc::clone(&self.exit_slot);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status
                .ok()
                .and_then(|s| s.code())
                .unwrap_or(-1);

            let was_stopping = {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let was_stopping = state.stopping;
                if state.pid == Some(pid) {
                    state.pid = None;
                    state.done = None;
                }
                was_stopping
            };

            if !was_stopping {
                observer.on_process_exit(code);
                exit_slot.publish(ExitInfo { code });
            }
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Stop the managed process group: SIGTERM, wait up to 5 s, then
    /// SIGKILL. Idempotent; safe when nothing is running.
    pub async fn stop(&self) {
        let (pid, done) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stopping = true;
            (state.pid.take(), state.done.take())
        };

        let Some(pid) = pid else { return };

        if kill_group(pid, libc::SIGTERM).is_err() {
            // Process already gone.
            return;
        }

        let Some(mut done) = done else { return };
        if tokio::time::timeout(TERM_GRACE, done.wait_for(|v| *v))
            .await
            .is_err()
        {
            warn!(pid, "process group ignored SIGTERM, sending SIGKILL");
            let _ = kill_group(pid, libc::SIGKILL);
            let _ = done.wait_for(|v| *v).await;
        }
    }

    /// Immediate SIGKILL to the process group, no grace.
    pub fn kill(&self) {
        let pid = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stopping = true;
            state.done.take();
            state.pid.take()
        };
        if let Some(pid) = pid {
            let _ = kill_group(pid, libc::SIGKILL);
        }
    }

    /// Rebuild and swap the managed process: run the pipeline, and only on
    /// success stop the old process and start the new one. A failed
    /// pipeline leaves the previous process untouched. Any stale entry in
    /// the exit slot is drained before the new start so an old exit is
    /// never attributed to the new process.
    pub async fn restart(&self) -> Result<Duration> {
        let duration = self.run_pipeline().await?;

        if self.run_cmd.is_some() {
            self.stop().await;
            self.exit_slot.drain();
            self.start().context("start")?;
        }

        Ok(duration)
    }

    /// Stop the managed process. Owned temp artifacts would be removed
    /// here too; shell-defined pipelines own their outputs themselves.
    pub async fn cleanup(&self) {
        self.stop().await;
    }
}

/// Build a `sh -c` command rooted at `root`, in its own process group.
fn shell_command(cmd: &str, root: &std::path::Path) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(cmd).current_dir(root);
    #[cfg(unix)]
    c.process_group(0);
    c
}

/// SIGTERM the child's group, wait up to the grace period, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    let Some(pid) = child.id().map(|p| p as i32) else {
        return;
    };
    let _ = kill_group(pid, libc::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = kill_group(pid, libc::SIGKILL);
        let _ = child.wait().await;
    }
}

/// Send `sig` to the entire process group of `pid`, falling back to the
/// process itself when the group cannot be determined.
#[cfg(unix)]
fn kill_group(pid: i32, sig: i32) -> std::io::Result<()> {
    let pgid = unsafe { libc::getpgid(pid) };
    let target = if pgid > 0 { -pgid } else { pid };
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
