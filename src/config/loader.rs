// src/config/loader.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::config::model::{LogPaths, OrchestratorDoc, TargetDoc};
use crate::config::template::{self, TemplateOptions, VarMap};

/// An orchestrator config after template resolution and validation.
#[derive(Debug, Clone)]
pub struct LoadedOrchestrator {
    pub doc: OrchestratorDoc,
    /// Fully resolved global template variables.
    pub resolved_vars: VarMap,
    /// Per-target resolved vars (globals merged under, target wins).
    pub target_vars: BTreeMap<String, VarMap>,
    /// Absolute directory of the config file; target paths resolve
    /// against it.
    pub base_dir: PathBuf,
    /// Absolute logs directory, when configured.
    pub logs_dir: Option<PathBuf>,
}

/// Check whether `path` exists; if not and it carries a `.yaml`/`.yml`
/// extension, try the sibling extension. Lets users spell either.
pub fn resolve_yaml_path(path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }

    let alt = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") => Some(path.with_extension("yml")),
        Some("yml") => Some(path.with_extension("yaml")),
        _ => None,
    };
    match alt {
        Some(alt) if alt.exists() => alt,
        _ => path.to_path_buf(),
    }
}

/// Sum-file path for a target config: same file name with the extension
/// replaced by `.sum`, alongside the target root.
pub fn sum_file_name(config_path: &Path) -> String {
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "watchrun".to_string());
    format!("{stem}.sum")
}

/// Load and validate a single target's config document, resolving its
/// templates with `parent_vars` injected from the orchestrator scope.
/// Returns the parsed document and the resolved variable map.
pub fn load_target_config(
    path: &Path,
    parent_vars: &VarMap,
) -> Result<(TargetDoc, VarMap)> {
    let path = resolve_yaml_path(path);
    let opts = TemplateOptions::with_vars(parent_vars.clone());
    let (text, vars) = template::process_file(&path, &opts)?;

    let mut doc: TargetDoc = serde_yaml::from_str(&text)
        .with_context(|| format!("parse config {}", path.display()))?;
    doc.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;

    Ok((doc, vars))
}

/// Load and validate the orchestrator document.
///
/// Resolved global vars are exported into the process environment so the
/// shell commands and child config resolution of every target observe
/// them; per-target vars are resolved against the globals and exported the
/// same way.
pub fn load_orchestrator_config(path: &Path) -> Result<LoadedOrchestrator> {
    let path = resolve_yaml_path(path);
    let (text, resolved_vars) =
        template::process_file(&path, &TemplateOptions::default())?;

    let mut doc: OrchestratorDoc = serde_yaml::from_str(&text)
        .with_context(|| format!("parse config {}", path.display()))?;

    for (k, v) in &resolved_vars {
        std::env::set_var(k, v);
    }

    let base_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let base_dir = base_dir
        .canonicalize()
        .unwrap_or(base_dir);

    // Resolve per-target vars with the globals as template data.
    let env: VarMap = std::env::vars().collect();
    let mut target_vars: BTreeMap<String, VarMap> = BTreeMap::new();
    for (name, entry) in &doc.targets {
        let mut merged = resolved_vars.clone();
        for (k, expr) in &entry.vars {
            let val = template::resolve_expr(expr, &resolved_vars, &env)
                .with_context(|| format!("target {name:?}: resolve var {k:?}"))?;
            std::env::set_var(k, &val);
            merged.insert(k.clone(), val);
        }
        target_vars.insert(name.clone(), merged);
    }

    // Resolve logs_dir against the config directory.
    let logs_dir = doc.logs_dir.as_ref().map(|d| {
        let p = PathBuf::from(d);
        if p.is_absolute() {
            p
        } else {
            base_dir.join(p)
        }
    });

    // Resolve relative link file paths and populate per-target log paths.
    for (name, entry) in doc.targets.iter_mut() {
        for link in entry.links.iter_mut() {
            if let Some(file) = link.file.clone() {
                let p = PathBuf::from(&file);
                if !p.is_absolute() {
                    link.file =
                        Some(base_dir.join(p).to_string_lossy().into_owned());
                }
            }
        }
        if let Some(dir) = &logs_dir {
            let norm = normalize_target_name(name);
            entry.logs = Some(LogPaths {
                build: dir.join(format!("{norm}.build.log")),
                run: dir.join(format!("{norm}.run.log")),
            });
        }
    }

    doc.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;

    debug!(
        targets = doc.targets.len(),
        port = doc.api.port,
        "orchestrator config loaded"
    );

    Ok(LoadedOrchestrator {
        doc,
        resolved_vars,
        target_vars,
        base_dir,
        logs_dir,
    })
}

/// Convert a target name to a safe file name component: lowercase, with
/// runs of characters outside `[a-z0-9_-]` collapsed to underscores.
pub fn normalize_target_name(name: &str) -> String {
    let re = Regex::new("[^a-z0-9_-]+").expect("static regex");
    re.replace_all(&name.to_lowercase(), "_").into_owned()
}
