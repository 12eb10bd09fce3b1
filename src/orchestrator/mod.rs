// src/orchestrator/mod.rs

//! Multi-target control plane: a name-indexed map of targets, bulk and
//! per-target control operations, and the HTTP API surface.

pub mod api;
pub mod logs;
pub mod target;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::config::loader::LoadedOrchestrator;
use crate::config::model::LogPaths;
use crate::config::template::VarMap;

pub use target::{Target, TargetState, TargetStatus};

/// Control-plane failures surfaced through the API.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("target {0:?} not found")]
    NotFound(String),
}

/// Owns every [`Target`] by name. The map is read-mostly: targets are
/// created once at load, lookups dominate, so a reader-biased lock guards
/// it; each target serializes its own state separately.
pub struct Orchestrator {
    targets: RwLock<HashMap<String, Arc<Target>>>,
    port: u16,
    logs_dir: Option<PathBuf>,
    resolved_vars: VarMap,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    /// Build the orchestrator from a loaded config: create the logs
    /// directory if needed and construct every target with its own root,
    /// log sinks and merged variable map.
    pub fn new(loaded: LoadedOrchestrator, cancel: CancellationToken) -> Result<Self> {
        if let Some(dir) = &loaded.logs_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("create logs_dir {}", dir.display()))?;
        }

        let tracker = TaskTracker::new();
        let mut targets = HashMap::with_capacity(loaded.doc.targets.len());
        for (name, entry) in &loaded.doc.targets {
            let parent_vars = loaded
                .target_vars
                .get(name)
                .cloned()
                .unwrap_or_else(|| loaded.resolved_vars.clone());
            let target = Target::new(
                name.clone(),
                entry.clone(),
                &loaded.base_dir,
                parent_vars,
                cancel.child_token(),
                tracker.clone(),
            );
            targets.insert(name.clone(), Arc::new(target));
        }

        Ok(Self {
            targets: RwLock::new(targets),
            port: loaded.doc.api.port,
            logs_dir: loaded.logs_dir,
            resolved_vars: loaded.resolved_vars,
            cancel,
            tracker,
        })
    }

    /// Wait for every target loop to finish after cancellation.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn logs_dir(&self) -> Option<&PathBuf> {
        self.logs_dir.as_ref()
    }

    pub fn resolved_vars(&self) -> &VarMap {
        &self.resolved_vars
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn get(&self, name: &str) -> Result<Arc<Target>, ControlError> {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    fn all(&self) -> Vec<Arc<Target>> {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Launch every enabled target.
    pub fn start_targets(&self) {
        for target in self.all() {
            if target.enabled() {
                if let Err(err) = target.start() {
                    warn!(name = %target.name(), error = %format!("{err:#}"), "failed to start target");
                }
            }
        }
    }

    /// Launch only the named targets; an empty filter behaves like
    /// [`Orchestrator::start_targets`].
    pub fn start_targets_filtered(&self, names: &[String]) {
        if names.is_empty() {
            self.start_targets();
            return;
        }
        for target in self.all() {
            if names.iter().any(|n| n == target.name()) {
                if let Err(err) = target.start() {
                    warn!(name = %target.name(), error = %format!("{err:#}"), "failed to start target");
                }
            }
        }
    }

    /// Gracefully stop every target (SIGTERM, grace, SIGKILL).
    pub fn stop_targets(&self) {
        for target in self.all() {
            target.stop();
        }
    }

    /// Immediately SIGKILL every target's process group.
    pub fn kill_targets(&self) {
        for target in self.all() {
            target.kill();
        }
    }

    pub fn start_target(&self, name: &str) -> Result<()> {
        Ok(self.get(name)?.start()?)
    }

    pub fn stop_target(&self, name: &str) -> Result<(), ControlError> {
        self.get(name)?.stop();
        Ok(())
    }

    /// Trigger a rebuild + restart for a target.
    pub fn build_target(&self, name: &str) -> Result<(), ControlError> {
        self.get(name)?.build();
        Ok(())
    }

    /// Restart is the same edge as build: re-run the pipeline and swap
    /// the process.
    pub fn restart_target(&self, name: &str) -> Result<(), ControlError> {
        self.build_target(name)
    }

    /// Start just the managed process (no rebuild).
    pub fn start_exec(&self, name: &str) -> Result<(), ControlError> {
        self.get(name)?.start_exec();
        Ok(())
    }

    /// Stop just the managed process; the watcher keeps running.
    pub fn stop_exec(&self, name: &str) -> Result<(), ControlError> {
        self.get(name)?.stop_exec();
        Ok(())
    }

    /// Set the enabled flag and start the target.
    pub fn enable_target(&self, name: &str) -> Result<()> {
        let target = self.get(name)?;
        target.set_enabled(true);
        target.start()
    }

    /// Stop the target and clear the enabled flag.
    pub fn disable_target(&self, name: &str) -> Result<(), ControlError> {
        let target = self.get(name)?;
        target.stop();
        target.set_enabled(false);
        Ok(())
    }

    /// Status snapshots of all targets, ordered by name.
    pub fn status(&self) -> Vec<TargetStatus> {
        let mut statuses: Vec<TargetStatus> =
            self.all().iter().map(|t| t.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn target_status(&self, name: &str) -> Result<TargetStatus, ControlError> {
        Ok(self.get(name)?.status())
    }

    /// Log file paths for one target, by stage.
    pub fn target_logs(&self, name: &str) -> Result<Option<LogPaths>, ControlError> {
        Ok(self.get(name)?.log_paths())
    }
}
