// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default HTTP API port when the config does not set one.
pub const DEFAULT_API_PORT: u16 = 9100;

/// Typed validation failures for config documents. Fatal at load time,
/// never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("watch must have at least one pattern")]
    EmptyWatch,
    #[error("at least one build or exec command is required")]
    NoCommands,
    #[error("at least one target is required")]
    NoTargets,
    #[error("target {target:?}: config is required")]
    MissingTargetConfig { target: String },
    #[error("target {target:?}: link {index} ({name:?}): cannot specify both url and file")]
    LinkBothUrlAndFile {
        target: String,
        index: usize,
        name: String,
    },
    #[error("target {target:?}: link {index} ({name:?}): must specify either url or file")]
    LinkNeitherUrlNorFile {
        target: String,
        index: usize,
        name: String,
    },
}

/// A single target's document (after template resolution): what to watch,
/// which preparation commands to run, and which process to manage.
///
/// The last `exec` entry is the managed long-running command; any earlier
/// `exec` entries are additional preparation steps run after `build`. A
/// document with `build` but no `exec` describes a build-only target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetDoc {
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub exec: Vec<String>,
}

impl TargetDoc {
    /// Check required fields and trim whitespace from commands (YAML
    /// literal blocks add trailing newlines).
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.watch.is_empty() {
            return Err(ConfigError::EmptyWatch);
        }
        if self.build.is_empty() && self.exec.is_empty() {
            return Err(ConfigError::NoCommands);
        }
        for cmd in self.build.iter_mut().chain(self.exec.iter_mut()) {
            *cmd = cmd.trim().to_string();
        }
        Ok(())
    }

    /// True when there is no managed process to supervise.
    pub fn is_build_only(&self) -> bool {
        self.exec.is_empty()
    }

    /// Preparation commands: every `build` entry plus all `exec` entries
    /// except the last.
    pub fn pipeline_steps(&self) -> Vec<String> {
        let mut steps = self.build.clone();
        if self.exec.len() > 1 {
            steps.extend(self.exec[..self.exec.len() - 1].iter().cloned());
        }
        steps
    }

    /// The managed command, if any.
    pub fn run_cmd(&self) -> Option<&str> {
        self.exec.last().map(String::as_str)
    }
}

/// `api:` section of the orchestrator document.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_API_PORT,
        }
    }
}

/// A named URL or file associated with a target, surfaced through the
/// status API. Exactly one of `url` / `file` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
}

/// Per-stage log file paths for a target, derived from `logs_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPaths {
    pub build: PathBuf,
    pub run: PathBuf,
}

/// One entry under `targets:` in the orchestrator document.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    /// Path to the target's own config file, relative to the orchestrator
    /// config directory. Its directory becomes the target root.
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Per-target template vars; override globals on conflict.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub links: Vec<Link>,
    /// Populated from `logs_dir` at load; not user-configurable.
    #[serde(skip)]
    pub logs: Option<LogPaths>,
}

impl TargetEntry {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Top-level orchestrator document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorDoc {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub logs_dir: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetEntry>,
}

impl OrchestratorDoc {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for (name, entry) in &self.targets {
            if entry.config.is_empty() {
                return Err(ConfigError::MissingTargetConfig {
                    target: name.clone(),
                });
            }
            for (i, link) in entry.links.iter().enumerate() {
                let has_url = link.url.as_deref().is_some_and(|u| !u.is_empty());
                let has_file = link.file.as_deref().is_some_and(|f| !f.is_empty());
                match (has_url, has_file) {
                    (true, true) => {
                        return Err(ConfigError::LinkBothUrlAndFile {
                            target: name.clone(),
                            index: i,
                            name: link.name.clone(),
                        });
                    }
                    (false, false) => {
                        return Err(ConfigError::LinkNeitherUrlNorFile {
                            target: name.clone(),
                            index: i,
                            name: link.name.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
