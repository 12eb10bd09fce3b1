use std::error::Error;
use std::fs;
use std::path::Path;

use tempfile::tempdir;

use watchrun::watch::{expand_patterns, parse_watch_patterns};

type TestResult = Result<(), Box<dyn Error>>;

fn write(root: &Path, rel: &str, content: &str) -> TestResult {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

#[test]
fn expands_patterns_to_matching_files() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "main.rs", "fn main() {}")?;
    write(dir.path(), "cmd/app.rs", "mod app;")?;
    write(dir.path(), "Cargo.toml", "[package]")?;
    write(dir.path(), "readme.md", "# readme")?;

    let patterns = parse_watch_patterns(&[
        "**/*.rs".to_string(),
        "Cargo.toml".to_string(),
    ]);
    let files = expand_patterns(dir.path(), &patterns)?;

    assert_eq!(files, vec!["Cargo.toml", "cmd/app.rs", "main.rs"]);
    Ok(())
}

#[test]
fn excludes_always_win() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "a.rs", "a")?;
    write(dir.path(), "gen/b_gen.rs", "b")?;

    let patterns = parse_watch_patterns(&[
        "**/*.rs".to_string(),
        "!**/*_gen.rs".to_string(),
        // Re-including an excluded file has no effect.
        "gen/b_gen.rs".to_string(),
    ]);
    let files = expand_patterns(dir.path(), &patterns)?;

    assert_eq!(files, vec!["a.rs"]);
    Ok(())
}

#[test]
fn double_star_matches_all_depths_including_root() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "top.txt", "1")?;
    write(dir.path(), "a/mid.txt", "2")?;
    write(dir.path(), "a/b/deep.txt", "3")?;

    let patterns = parse_watch_patterns(&["**/*".to_string()]);
    let files = expand_patterns(dir.path(), &patterns)?;

    assert_eq!(files, vec!["a/b/deep.txt", "a/mid.txt", "top.txt"]);
    Ok(())
}

#[test]
fn results_are_sorted_and_deduplicated() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "x.rs", "x")?;
    write(dir.path(), "y.rs", "y")?;

    // Overlapping patterns must not produce duplicates.
    let patterns = parse_watch_patterns(&[
        "**/*.rs".to_string(),
        "*.rs".to_string(),
        "x.rs".to_string(),
    ]);
    let files = expand_patterns(dir.path(), &patterns)?;

    assert_eq!(files, vec!["x.rs", "y.rs"]);
    Ok(())
}

#[test]
fn alternation_and_classes_are_supported() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "app.ts", "ts")?;
    write(dir.path(), "app.js", "js")?;
    write(dir.path(), "app.rs", "rs")?;
    write(dir.path(), "a1.txt", "1")?;
    write(dir.path(), "a2.txt", "2")?;
    write(dir.path(), "a9.txt", "9")?;

    let patterns = parse_watch_patterns(&["app.{ts,js}".to_string()]);
    assert_eq!(expand_patterns(dir.path(), &patterns)?, vec!["app.js", "app.ts"]);

    let patterns = parse_watch_patterns(&["a[12].txt".to_string()]);
    assert_eq!(expand_patterns(dir.path(), &patterns)?, vec!["a1.txt", "a2.txt"]);
    Ok(())
}

#[test]
fn parent_directory_patterns_stay_root_relative() -> TestResult {
    let dir = tempdir()?;
    write(dir.path(), "lib/shared.rs", "shared")?;
    write(dir.path(), "svc/main.rs", "main")?;

    let root = dir.path().join("svc");
    let patterns = parse_watch_patterns(&[
        "**/*.rs".to_string(),
        "../lib/**/*.rs".to_string(),
    ]);
    let files = expand_patterns(&root, &patterns)?;

    assert_eq!(files, vec!["../lib/shared.rs", "main.rs"]);
    Ok(())
}

#[test]
fn invalid_pattern_is_an_error() {
    let dir = tempdir().unwrap();
    let patterns = parse_watch_patterns(&["a[".to_string()]);
    assert!(expand_patterns(dir.path(), &patterns).is_err());
}
