// src/config/template.rs

//! Template variable resolution for config documents.
//!
//! A document may carry a top-level `vars:` section whose values are
//! template expressions. Two interchangeable delimiter pairs are
//! recognised, `[[ ]]` and `{{ }}`; the `[[ ]]` pass runs first so values
//! that must survive into the host document can use the alternate pair.
//!
//! Supported inside an expression:
//! - variable references: `.NAME`
//! - string and integer literals
//! - functions: `default`, `required`, `env`, `add`, `int` / `asInt`
//! - pipelines: `{{ .PORT | int }}`
//!
//! Lookup priority is environment variables, then vars injected by a
//! parent scope, then the document's own `vars:` section. Vars resolve
//! iteratively (up to [`MAX_PASSES`] passes) so they may reference each
//! other; the loop stops when a pass makes no progress and the first
//! stuck var is reported.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

/// Placeholder substituted for an undefined variable reference. Its
/// presence after the full-document pass is a fatal configuration error.
const NO_VALUE: &str = "<no value>";

/// Upper bound on var-resolution passes.
const MAX_PASSES: usize = 10;

const VARS_KEY: &str = "vars";

/// String-to-string variable map used throughout resolution.
pub type VarMap = BTreeMap<String, String>;

/// Options for [`process`].
#[derive(Debug, Clone, Default)]
pub struct TemplateOptions {
    /// Vars injected by a parent scope. Lower priority than real
    /// environment variables, higher than the document's `vars:` section.
    pub vars: VarMap,
    /// Environment override; `None` reads the process environment.
    pub env: Option<VarMap>,
}

impl TemplateOptions {
    pub fn with_vars(vars: VarMap) -> Self {
        Self {
            vars,
            env: None,
        }
    }
}

/// Read a YAML document from `path` and run template processing on it.
/// Returns the processed text (with the `vars:` section removed) and the
/// fully resolved variable map.
pub fn process_file(path: &Path, opts: &TemplateOptions) -> Result<(String, VarMap)> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    process(&data, opts)
}

/// Run template processing on a raw document.
pub fn process(data: &str, opts: &TemplateOptions) -> Result<(String, VarMap)> {
    let mut env = match &opts.env {
        Some(env) => env.clone(),
        None => environ_map(),
    };

    // Parent vars merge below real environment entries.
    for (k, v) in &opts.vars {
        env.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let resolved = resolve_vars(data, &env)?;

    // Full-document pass: resolved vars overlaid by env (env wins).
    let mut values = resolved.clone();
    for (k, v) in &env {
        values.insert(k.clone(), v.clone());
    }

    let mut result = execute_template(data, &values, &env, "[[", "]]")
        .context("template error (using [[ ]])")?;
    result = execute_template(&result, &values, &env, "{{", "}}")
        .context("template error (using {{ }})")?;

    if result.contains(NO_VALUE) {
        bail!(undefined_variable_report(data, &result));
    }

    let result = remove_vars_section(&result);
    Ok((result, resolved))
}

/// Evaluate a single expression string against already-resolved values.
/// Both delimiter pairs are tried, alternate first.
pub fn resolve_expr(expr: &str, values: &VarMap, env: &VarMap) -> Result<String> {
    let mut result = expr.to_string();
    if result.contains("[[") {
        result = execute_template(&result, values, env, "[[", "]]")?;
    }
    if result.contains("{{") {
        result = execute_template(&result, values, env, "{{", "}}")?;
    }
    Ok(result)
}

/// Extract the `vars:` section and resolve its expressions iteratively.
fn resolve_vars(data: &str, env: &VarMap) -> Result<VarMap> {
    let mut unresolved = raw_vars_section(data);
    let mut resolved = VarMap::new();

    if unresolved.is_empty() {
        return Ok(resolved);
    }

    for _ in 0..MAX_PASSES {
        if unresolved.is_empty() {
            break;
        }

        let mut progress = false;
        for (name, expr) in unresolved.clone() {
            let mut values = resolved.clone();
            for (k, v) in env {
                values.insert(k.clone(), v.clone());
            }

            // A failing function usually means a dependency is not yet
            // resolved; leave the var for a later pass.
            let val = match resolve_expr(&expr, &values, env) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if val.contains("{{") || val.contains("[[") || val.contains(NO_VALUE) {
                continue;
            }

            resolved.insert(name.clone(), val);
            unresolved.remove(&name);
            progress = true;
        }

        if !progress {
            break;
        }
    }

    // One more attempt on the first stuck var, to surface a useful error.
    if let Some((name, expr)) = unresolved.iter().next() {
        let mut values = resolved.clone();
        for (k, v) in env {
            values.insert(k.clone(), v.clone());
        }
        return match resolve_expr(expr, &values, env) {
            Err(e) => Err(e.context(format!("var {name:?}"))),
            Ok(_) => Err(anyhow!(
                "var {name:?} could not be resolved (circular dependency or undefined reference)"
            )),
        };
    }

    Ok(resolved)
}

/// Parse the raw `vars:` mapping out of the document, stringifying scalar
/// values. A document without a vars section yields an empty map.
fn raw_vars_section(data: &str) -> VarMap {
    #[derive(serde::Deserialize)]
    struct RawDoc {
        #[serde(default)]
        vars: BTreeMap<String, serde_yaml::Value>,
    }

    let raw: RawDoc = match serde_yaml::from_str(data) {
        Ok(r) => r,
        Err(_) => return VarMap::new(),
    };

    raw.vars
        .into_iter()
        .map(|(k, v)| (k, yaml_scalar_to_string(&v)))
        .collect()
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Remove the top-level `vars:` key from the processed document.
fn remove_vars_section(data: &str) -> String {
    let mut doc: serde_yaml::Value = match serde_yaml::from_str(data) {
        Ok(v) => v,
        Err(_) => return data.to_string(),
    };
    if let serde_yaml::Value::Mapping(ref mut map) = doc {
        map.remove(VARS_KEY);
    }
    serde_yaml::to_string(&doc).unwrap_or_else(|_| data.to_string())
}

/// Build the undefined-variable error message, citing the line numbers of
/// the offending lines in the original (pre-substitution) document.
fn undefined_variable_report(original: &str, result: &str) -> String {
    let original_lines: Vec<&str> = original.lines().collect();
    let mut msg = String::from(
        "undefined variable in config. Use the 'default' function or define the variable.\nProblem lines:",
    );
    for (i, line) in result.lines().enumerate() {
        if line.contains(NO_VALUE) {
            let original_line = original_lines.get(i).copied().unwrap_or("");
            let _ = write!(msg, "\n  line {}: {}", i + 1, original_line.trim());
        }
    }
    msg
}

fn environ_map() -> VarMap {
    std::env::vars().collect()
}

// --- expression evaluation -------------------------------------------------

/// An intermediate value inside an expression. `Missing` renders as the
/// `<no value>` placeholder, matching a zero-valued map lookup.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Missing,
}

impl Value {
    fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Missing => NO_VALUE.to_string(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Value::Missing) || matches!(self, Value::Str(s) if s.is_empty())
    }
}

/// Substitute every `left ... right` expression in `data`.
fn execute_template(
    data: &str,
    values: &VarMap,
    env: &VarMap,
    left: &str,
    right: &str,
) -> Result<String> {
    let mut out = String::with_capacity(data.len());
    let mut rest = data;

    while let Some(start) = rest.find(left) {
        out.push_str(&rest[..start]);
        let after = &rest[start + left.len()..];
        let Some(end) = after.find(right) else {
            bail!("unterminated {left} ... {right} expression");
        };
        let expr = &after[..end];
        let value = eval_pipeline(expr, values, env)?;
        out.push_str(&value.render());
        rest = &after[end + right.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Evaluate one expression: pipeline stages separated by `|`, where each
/// later stage receives the previous result as its final argument.
fn eval_pipeline(expr: &str, values: &VarMap, env: &VarMap) -> Result<Value> {
    let stages = split_pipeline(expr);
    if stages.is_empty() {
        bail!("empty template expression");
    }

    let mut piped: Option<Value> = None;
    for stage in stages {
        let tokens = tokenize(&stage)?;
        if tokens.is_empty() {
            bail!("empty pipeline stage in {expr:?}");
        }
        piped = Some(eval_stage(&tokens, piped, values, env)?);
    }
    Ok(piped.expect("pipeline evaluated at least one stage"))
}

fn eval_stage(
    tokens: &[Token],
    piped: Option<Value>,
    values: &VarMap,
    env: &VarMap,
) -> Result<Value> {
    // A lone value token is the common `{{ .NAME }}` form.
    if tokens.len() == 1 && piped.is_none() {
        if let Some(v) = value_token(&tokens[0], values) {
            return Ok(v);
        }
    }

    let Token::Ident(name) = &tokens[0] else {
        bail!("expected function name, found {:?}", tokens[0]);
    };

    let mut args: Vec<Value> = tokens[1..]
        .iter()
        .map(|t| {
            value_token(t, values)
                .ok_or_else(|| anyhow!("invalid argument {t:?} for function {name:?}"))
        })
        .collect::<Result<_>>()?;
    if let Some(v) = piped {
        args.push(v);
    }

    call_function(name, &args, env)
}

fn value_token(token: &Token, values: &VarMap) -> Option<Value> {
    match token {
        Token::Field(name) => Some(
            values
                .get(name)
                .map(|s| Value::Str(s.clone()))
                .unwrap_or(Value::Missing),
        ),
        Token::Str(s) => Some(Value::Str(s.clone())),
        Token::Int(n) => Some(Value::Int(*n)),
        Token::Ident(_) => None,
    }
}

fn call_function(name: &str, args: &[Value], env: &VarMap) -> Result<Value> {
    match name {
        "default" => {
            let [def, val] = args else {
                bail!("default expects 2 arguments, got {}", args.len());
            };
            Ok(if val.is_empty() { def.clone() } else { val.clone() })
        }
        "required" => {
            let [msg, val] = args else {
                bail!("required expects 2 arguments, got {}", args.len());
            };
            if val.is_empty() {
                bail!("{}", msg.render());
            }
            Ok(val.clone())
        }
        "env" => {
            let [key] = args else {
                bail!("env expects 1 argument, got {}", args.len());
            };
            Ok(Value::Str(
                env.get(&key.render()).cloned().unwrap_or_default(),
            ))
        }
        "add" => {
            let [a, b] = args else {
                bail!("add expects 2 arguments, got {}", args.len());
            };
            let a = to_int(a).context("add: first argument")?;
            let b = to_int(b).context("add: second argument")?;
            Ok(Value::Int(a + b))
        }
        "int" | "asInt" => {
            let [val] = args else {
                bail!("{name} expects 1 argument, got {}", args.len());
            };
            Ok(Value::Int(to_int(val)?))
        }
        other => bail!("unknown template function {other:?}"),
    }
}

fn to_int(v: &Value) -> Result<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::Str(s) => {
            // Still-templated input coerces to 0 without error so the
            // iterative var loop can retry once the dependency resolves.
            if s.contains("{{") || s.contains("[[") {
                return Ok(0);
            }
            s.trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("cannot convert {s:?} to int"))
        }
        Value::Missing => Err(anyhow!("cannot convert missing value to int")),
    }
}

// --- tokenizer -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// `.NAME` variable reference.
    Field(String),
    /// Bare identifier (function name).
    Ident(String),
    /// Quoted string literal.
    Str(String),
    /// Integer literal.
    Int(i64),
}

/// Split an expression on top-level `|`, respecting quoted strings.
fn split_pipeline(expr: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in expr.chars() {
        match c {
            '\\' if in_quotes && !escaped => {
                escaped = true;
                current.push(c);
            }
            '"' if !escaped => {
                in_quotes = !in_quotes;
                current.push(c);
                escaped = false;
            }
            '|' if !in_quotes => {
                stages.push(current.trim().to_string());
                current = String::new();
            }
            _ => {
                escaped = false;
                current.push(c);
            }
        }
    }
    let last = current.trim();
    if !last.is_empty() || !stages.is_empty() {
        stages.push(last.to_string());
    }
    stages.retain(|s| !s.is_empty());
    stages
}

fn tokenize(stage: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = stage.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(esc) = chars.next() {
                            s.push(esc);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => s.push(other),
                }
            }
            if !closed {
                bail!("unterminated string literal in {stage:?}");
            }
            tokens.push(Token::Str(s));
        } else if c == '.' {
            chars.next();
            let name: String = take_ident(&mut chars);
            if name.is_empty() {
                bail!("expected variable name after '.' in {stage:?}");
            }
            tokens.push(Token::Field(name));
        } else if c.is_ascii_digit() || c == '-' {
            let mut lit = String::new();
            lit.push(c);
            chars.next();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    lit.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let n = lit
                .parse::<i64>()
                .map_err(|_| anyhow!("invalid integer literal {lit:?}"))?;
            tokens.push(Token::Int(n));
        } else {
            let name = take_ident(&mut chars);
            if name.is_empty() {
                bail!("unexpected character {c:?} in {stage:?}");
            }
            tokens.push(Token::Ident(name));
        }
    }

    Ok(tokens)
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_with_env(pairs: &[(&str, &str)]) -> TemplateOptions {
        TemplateOptions {
            vars: VarMap::new(),
            env: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }

    #[test]
    fn passes_through_plain_documents() {
        let (out, vars) = process("name: hello\nport: 8080\n", &opts_with_env(&[])).unwrap();
        assert!(vars.is_empty());
        assert!(out.contains("name: hello"));
        assert!(out.contains("port: 8080"));
    }

    #[test]
    fn resolves_vars_and_strips_the_section() {
        let doc = "vars:\n  app: myapp\nname: \"{{ .app }}\"\n";
        let (out, vars) = process(doc, &opts_with_env(&[])).unwrap();
        assert_eq!(vars.get("app").unwrap(), "myapp");
        assert!(out.contains("name: myapp"));
        assert!(!out.contains("vars:"));
    }

    #[test]
    fn env_overrides_document_vars() {
        let doc = "vars:\n  PORT: \"3000\"\nport: \"{{ .PORT }}\"\n";
        let (out, _) = process(doc, &opts_with_env(&[("PORT", "5000")])).unwrap();
        assert!(out.contains("5000"), "{out}");
    }

    #[test]
    fn parent_vars_sit_between_env_and_document() {
        let doc = "vars:\n  A: doc\nv: \"{{ .A }} {{ .B }}\"\n";
        let mut opts = opts_with_env(&[("A", "env")]);
        opts.vars.insert("A".into(), "parent".into());
        opts.vars.insert("B".into(), "parent-b".into());
        let (out, _) = process(doc, &opts).unwrap();
        assert!(out.contains("env parent-b"), "{out}");
    }

    #[test]
    fn vars_resolve_across_passes() {
        let doc = "vars:\n  BASE: \"100\"\n  PORT: \"{{ add .BASE 80 }}\"\n";
        let (_, vars) = process(doc, &opts_with_env(&[])).unwrap();
        assert_eq!(vars.get("PORT").unwrap(), "180");
    }

    #[test]
    fn alternate_delimiters_resolve_first() {
        let doc = "vars:\n  X: \"[[ add 1 2 ]]\"\nv: \"[[ .X ]]-{{ .X }}\"\n";
        let (out, _) = process(doc, &opts_with_env(&[])).unwrap();
        assert!(out.contains("3-3"), "{out}");
    }

    #[test]
    fn default_and_required_follow_emptiness() {
        let values = VarMap::new();
        let env = VarMap::new();
        assert_eq!(
            resolve_expr("{{ default \"fallback\" .MISSING }}", &values, &env).unwrap(),
            "fallback"
        );
        let err = resolve_expr("{{ required \"X is mandatory\" .MISSING }}", &values, &env)
            .unwrap_err();
        assert!(err.to_string().contains("X is mandatory"));
    }

    #[test]
    fn env_function_reads_unset_as_empty() {
        let values = VarMap::new();
        let mut env = VarMap::new();
        env.insert("HOME_DIR".into(), "/tmp/x".into());
        assert_eq!(
            resolve_expr("{{ env \"HOME_DIR\" }}", &values, &env).unwrap(),
            "/tmp/x"
        );
        assert_eq!(resolve_expr("{{ env \"NOPE\" }}", &values, &env).unwrap(), "");
    }

    #[test]
    fn pipe_coerces_to_int() {
        let mut values = VarMap::new();
        values.insert("PORT".into(), "8080".into());
        let env = VarMap::new();
        assert_eq!(
            resolve_expr("{{ .PORT | int }}", &values, &env).unwrap(),
            "8080"
        );
    }

    #[test]
    fn undefined_body_reference_reports_original_lines() {
        let doc = "name: ok\nport: \"{{ .UNDEFINED }}\"\n";
        let err = process(doc, &opts_with_env(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "{msg}");
        assert!(msg.contains(".UNDEFINED"), "{msg}");
    }

    #[test]
    fn circular_vars_report_the_stuck_var() {
        let doc = "vars:\n  A: \"{{ .B }}\"\n  B: \"{{ .A }}\"\nv: ok\n";
        let err = process(doc, &opts_with_env(&[])).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("circular dependency or undefined reference"), "{msg}");
    }
}
