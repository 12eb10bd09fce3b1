// src/watch/patterns.rs

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// A single watch pattern, either include or exclude.
///
/// Patterns use gitignore-style glob syntax: `**` for recursive matches,
/// `{a,b}` alternation and `[abc]` character classes. A pattern whose raw
/// string came in with a leading `!` is an exclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub raw: String,
    pub negated: bool,
}

/// Convert raw config strings into [`Pattern`]s. A leading `!` marks the
/// pattern as an exclusion.
pub fn parse_watch_patterns(watch: &[String]) -> Vec<Pattern> {
    watch
        .iter()
        .map(|w| match w.strip_prefix('!') {
            Some(rest) => Pattern {
                raw: rest.to_string(),
                negated: true,
            },
            None => Pattern {
                raw: w.clone(),
                negated: false,
            },
        })
        .collect()
}

/// Expand the patterns relative to `root` and return a sorted, deduplicated
/// list of matching file paths (relative to root, forward slashes).
///
/// All include patterns are expanded first; exclude matches are then removed
/// from the set, so an excluded file can never be re-included.
pub fn expand_patterns(root: &Path, patterns: &[Pattern]) -> Result<Vec<String>> {
    let mut includes: BTreeSet<String> = BTreeSet::new();

    for p in patterns.iter().filter(|p| !p.negated) {
        for m in expand_single_pattern(root, &p.raw)
            .with_context(|| format!("glob {:?}", p.raw))?
        {
            includes.insert(m);
        }
    }

    for p in patterns.iter().filter(|p| p.negated) {
        for m in expand_single_pattern(root, &p.raw)
            .with_context(|| format!("glob {:?}", p.raw))?
        {
            includes.remove(&m);
        }
    }

    Ok(includes.into_iter().collect())
}

/// Compile the include patterns into a single [`GlobSet`] for path matching.
pub fn compile_includes(patterns: &[Pattern]) -> Result<GlobSet> {
    compile_set(patterns.iter().filter(|p| !p.negated).map(|p| p.raw.as_str()))
}

/// Compile the exclude patterns into a single [`GlobSet`].
pub fn compile_excludes(patterns: &[Pattern]) -> Result<GlobSet> {
    compile_set(patterns.iter().filter(|p| p.negated).map(|p| p.raw.as_str()))
}

fn compile_set<'a>(raws: impl Iterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for raw in raws {
        builder.add(
            GlobBuilder::new(raw)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid glob pattern: {raw}"))?,
        );
    }
    Ok(builder.build()?)
}

/// Expand one glob pattern rooted at `root`.
///
/// Patterns starting with `..` resolve their directory prefix against the
/// root and re-prefix the matches so the results stay root-relative
/// (e.g. `../lib/**/*.rs` yields `../lib/src/x.rs`).
fn expand_single_pattern(root: &Path, pattern: &str) -> Result<Vec<String>> {
    if !pattern.starts_with("..") {
        return walk_matching(root, pattern, "");
    }

    let (dir, glob_part) = split_pattern(pattern);
    let base = root.join(&dir);
    let mut prefix = dir.replace('\\', "/");
    prefix.push('/');
    walk_matching(&base, &glob_part, &prefix)
}

/// Split a pattern into its literal leading directory part and the glob
/// remainder, e.g. `../lib/**/*.rs` becomes `("../lib", "**/*.rs")`.
fn split_pattern(pattern: &str) -> (String, String) {
    let mut dir_parts: Vec<&str> = Vec::new();
    let mut rest: Vec<&str> = Vec::new();
    let mut in_glob = false;

    for part in pattern.split('/') {
        if !in_glob && !part.contains(['*', '?', '[', '{']) {
            dir_parts.push(part);
        } else {
            in_glob = true;
            rest.push(part);
        }
    }

    // A fully literal pattern keeps its file name as the glob part.
    if rest.is_empty() {
        if let Some(last) = dir_parts.pop() {
            rest.push(last);
        }
    }

    (dir_parts.join("/"), rest.join("/"))
}

/// Walk `base` recursively and collect relative paths of files that match
/// `pattern`. Transient IO errors on individual entries are skipped; they
/// re-surface on the next scan.
fn walk_matching(base: &Path, pattern: &str, prefix: &str) -> Result<Vec<String>> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob pattern: {pattern}"))?
        .compile_matcher();

    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![base.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(base) {
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if glob.is_match(&rel_str) {
                        out.push(format!("{prefix}{rel_str}"));
                    }
                }
            }
        }
    }

    Ok(out)
}
