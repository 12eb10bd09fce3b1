// src/config/mod.rs

//! Configuration documents and template variable resolution.

pub mod loader;
pub mod model;
pub mod template;

pub use loader::{
    load_orchestrator_config, load_target_config, normalize_target_name,
    resolve_yaml_path, sum_file_name, LoadedOrchestrator,
};
pub use model::{
    ApiSection, ConfigError, Link, LogPaths, OrchestratorDoc, TargetDoc,
    TargetEntry, DEFAULT_API_PORT,
};
pub use template::{process, process_file, resolve_expr, TemplateOptions, VarMap};
