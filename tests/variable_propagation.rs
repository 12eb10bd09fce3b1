use std::error::Error;
use std::fs;

use tempfile::tempdir;

use watchrun::config::template::{process, TemplateOptions, VarMap};
use watchrun::config::{load_orchestrator_config, load_target_config};

type TestResult = Result<(), Box<dyn Error>>;

fn env(pairs: &[(&str, &str)]) -> VarMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn global_vars_resolve_with_arithmetic() -> TestResult {
    let doc = concat!(
        "vars:\n",
        "  BASE: \"100\"\n",
        "  PORT: \"{{ add .BASE 80 }}\"\n",
        "port: \"{{ .PORT }}\"\n",
    );

    let opts = TemplateOptions {
        vars: VarMap::new(),
        env: Some(env(&[])),
    };
    let (out, vars) = process(doc, &opts)?;

    assert_eq!(vars.get("PORT").map(String::as_str), Some("180"));
    assert!(out.contains("180"), "{out}");
    Ok(())
}

#[test]
fn environment_overrides_document_vars() -> TestResult {
    let doc = concat!(
        "vars:\n",
        "  BASE: \"100\"\n",
        "  PORT: \"{{ add .BASE 80 }}\"\n",
        "port: \"{{ .PORT }}\"\n",
    );

    let opts = TemplateOptions {
        vars: VarMap::new(),
        env: Some(env(&[("BASE", "200")])),
    };
    let (_, vars) = process(doc, &opts)?;

    assert_eq!(vars.get("PORT").map(String::as_str), Some("280"));
    Ok(())
}

#[test]
fn target_vars_override_globals_but_globals_stay_resolved() -> TestResult {
    let dir = tempdir()?;
    fs::create_dir_all(dir.path().join("svc"))?;
    fs::write(
        dir.path().join("svc/run.yaml"),
        concat!(
            "watch: ['**/*.rs']\n",
            "build: ['true']\n",
            "exec: ['./app --port {{ .WR_PROP_PORT }}']\n",
        ),
    )?;
    fs::write(
        dir.path().join("watchrun.yaml"),
        concat!(
            "vars:\n",
            "  WR_PROP_BASE: \"100\"\n",
            "  WR_PROP_PORT: \"{{ add .WR_PROP_BASE 80 }}\"\n",
            "targets:\n",
            "  svc:\n",
            "    config: svc/run.yaml\n",
            "    vars:\n",
            "      WR_PROP_PORT: \"9999\"\n",
        ),
    )?;

    let loaded = load_orchestrator_config(&dir.path().join("watchrun.yaml"))?;

    // The orchestrator still reports the resolved global.
    assert_eq!(
        loaded.resolved_vars.get("WR_PROP_PORT").map(String::as_str),
        Some("180")
    );
    // The target sees its own override.
    let svc_vars = loaded.target_vars.get("svc").unwrap();
    assert_eq!(svc_vars.get("WR_PROP_PORT").map(String::as_str), Some("9999"));

    // And the override flows into the target's document. The target var
    // was exported to the environment at load, so parent vars and env
    // agree here.
    let (doc, _) = load_target_config(&dir.path().join("svc/run.yaml"), svc_vars)?;
    assert_eq!(doc.exec[0], "./app --port 9999");
    Ok(())
}

#[test]
fn required_function_fails_the_load() -> TestResult {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("run.yaml"),
        concat!(
            "vars:\n",
            "  KEY: \"{{ required \\\"KEY must be set\\\" .WR_PROP_UNSET }}\"\n",
            "watch: ['**/*']\n",
            "build: ['true']\n",
        ),
    )?;

    let err = load_target_config(&dir.path().join("run.yaml"), &VarMap::new())
        .unwrap_err();
    assert!(format!("{err:#}").contains("KEY must be set"), "{err:#}");
    Ok(())
}

#[test]
fn undefined_body_variable_cites_original_line() -> TestResult {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("run.yaml"),
        "watch: ['**/*']\nbuild: ['echo {{ .WR_PROP_NOPE }}']\n",
    )?;

    let err = load_target_config(&dir.path().join("run.yaml"), &VarMap::new())
        .unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("line 2"), "{msg}");
    assert!(msg.contains("WR_PROP_NOPE"), "{msg}");
    Ok(())
}
