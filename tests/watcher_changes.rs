mod common;

use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use watchrun::watch::{
    parse_watch_patterns, scan_files, ChangeSet, Pattern, SumMap, Watcher,
};

type TestResult = Result<(), Box<dyn Error>>;

const POLL: Duration = Duration::from_millis(50);
const DEBOUNCE: Duration = Duration::from_millis(50);
const WAIT: Duration = Duration::from_secs(5);

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn spawn_watcher(
    root: &Path,
    patterns: Vec<Pattern>,
    initial: SumMap,
) -> (mpsc::Receiver<ChangeSet>, CancellationToken) {
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let watcher = Watcher::new(
        root.to_path_buf(),
        patterns,
        POLL,
        DEBOUNCE,
        initial,
        tx,
        cancel.clone(),
    );
    tokio::spawn(watcher.run());
    (rx, cancel)
}

#[tokio::test]
async fn detects_modified_files() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "original");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    write(dir.path(), "a.txt", "modified content");

    let changes = timeout(WAIT, rx.recv()).await?.expect("change set");
    assert!(changes.modified.contains(&"a.txt".to_string()), "{changes:?}");

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn files_unknown_to_the_snapshot_report_as_added() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "existing");
    write(dir.path(), "b.txt", "also exists");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    // Only a.txt makes it into the initial snapshot, simulating a file
    // added between the scan and watcher start.
    let mut initial = scan_files(dir.path(), &patterns)?;
    initial.remove("b.txt");

    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    write(dir.path(), "a.txt", "modified existing");

    let changes = timeout(WAIT, rx.recv()).await?.expect("change set");
    assert!(changes.modified.contains(&"a.txt".to_string()), "{changes:?}");
    assert!(changes.added.contains(&"b.txt".to_string()), "{changes:?}");

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn detects_removed_files() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "to be removed");
    write(dir.path(), "b.txt", "stays");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    fs::remove_file(dir.path().join("a.txt"))?;

    let changes = timeout(WAIT, rx.recv()).await?.expect("change set");
    assert!(changes.removed.contains(&"a.txt".to_string()), "{changes:?}");

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn excluded_files_never_produce_changes() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "watched");
    write(dir.path(), "ignored.txt", "excluded");

    let patterns = parse_watch_patterns(&[
        "**/*.txt".to_string(),
        "!ignored.txt".to_string(),
    ]);
    let initial = scan_files(dir.path(), &patterns)?;
    assert!(!initial.contains_key("ignored.txt"));

    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    write(dir.path(), "ignored.txt", "modified excluded content");

    // No delivery within a generous window.
    assert!(
        timeout(Duration::from_millis(600), rx.recv()).await.is_err(),
        "excluded file produced a change set"
    );

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn metadata_only_touch_produces_no_changes() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "stable content");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    // Rewrite identical bytes: mtime moves, content hash does not.
    write(dir.path(), "a.txt", "stable content");

    assert!(
        timeout(Duration::from_millis(600), rx.recv()).await.is_err(),
        "metadata-only change produced a change set"
    );

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn burst_of_edits_coalesces_into_one_delivery() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "a0");
    write(dir.path(), "b.txt", "b0");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    write(dir.path(), "a.txt", "a1");
    write(dir.path(), "b.txt", "b1");

    // Both edits fall inside one debounce window and merge into a single
    // delivery.
    let mut changes = timeout(WAIT, rx.recv()).await?.expect("change set");
    while !changes.modified.contains(&"b.txt".to_string()) {
        let more = timeout(WAIT, rx.recv()).await?.expect("follow-up change set");
        changes.merge(more);
    }
    let mut modified = changes.modified.clone();
    modified.sort();
    assert_eq!(modified, vec!["a.txt", "b.txt"], "{changes:?}");

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_the_loop_without_delivery() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "content");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    // The channel closes once the loop returns; nothing is delivered.
    let outcome = timeout(WAIT, rx.recv()).await?;
    assert!(outcome.is_none());
    Ok(())
}

#[tokio::test]
async fn consecutive_quiet_polls_deliver_nothing() -> TestResult {
    common::init_tracing();
    let dir = tempdir()?;
    write(dir.path(), "a.txt", "quiet");

    let patterns = parse_watch_patterns(&["**/*.txt".to_string()]);
    let initial = scan_files(dir.path(), &patterns)?;
    let (mut rx, cancel) = spawn_watcher(dir.path(), patterns, initial);

    assert!(
        timeout(Duration::from_millis(600), rx.recv()).await.is_err(),
        "quiet tree produced a change set"
    );

    cancel.cancel();
    Ok(())
}
