// src/watch/watcher.rs

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use globset::GlobSet;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::watch::hash::hash_file;
use crate::watch::patterns::{
    compile_excludes, compile_includes, expand_patterns, Pattern,
};
use crate::watch::sums::{diff_sums, ChangeSet, SumMap};

/// How often the tracked file/directory sets are re-expanded to pick up
/// directories created before the event layer attached.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Cached stat info used to skip re-hashing files whose mtime and size
/// have not changed since the last scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStat {
    mtime: SystemTime,
    size: u64,
}

/// Messages bridged from the blocking notify callback into the async loop.
enum WatchMsg {
    Event(Event),
    Error,
}

/// Hybrid change detector: filesystem events mark the tree dirty, a poll
/// tick rescans and hashes only when dirty, and non-empty diffs are merged
/// and delivered after a debounce window of quiet.
///
/// Delivered [`ChangeSet`]s are non-empty and reflect the snapshot state at
/// the scan that produced them; after delivery the in-memory snapshot holds
/// the post-change hashes.
pub struct Watcher {
    root: PathBuf,
    patterns: Vec<Pattern>,
    poll_interval: Duration,
    debounce: Duration,
    changes_tx: mpsc::Sender<ChangeSet>,
    cancel: CancellationToken,

    sums: SumMap,
    stat_cache: HashMap<String, FileStat>,
    tracked_files: HashSet<String>,
    tracked_dirs: HashSet<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
    fsw: Option<RecommendedWatcher>,
    dirty: bool,
}

impl Watcher {
    /// Create a watcher seeded with the snapshot taken at startup. The
    /// stat cache is primed from the snapshot so the first scan can skip
    /// unchanged files.
    pub fn new(
        root: PathBuf,
        patterns: Vec<Pattern>,
        poll_interval: Duration,
        debounce: Duration,
        initial_sums: SumMap,
        changes_tx: mpsc::Sender<ChangeSet>,
        cancel: CancellationToken,
    ) -> Self {
        // Event paths arrive absolute; a stable canonical root keeps
        // relativization exact.
        let root = root.canonicalize().unwrap_or(root);

        let mut stat_cache = HashMap::with_capacity(initial_sums.len());
        for path in initial_sums.keys() {
            if let Some(st) = stat_path(&root.join(path)) {
                stat_cache.insert(path.clone(), st);
            }
        }

        Self {
            root,
            patterns,
            poll_interval,
            debounce,
            changes_tx,
            cancel,
            sums: initial_sums,
            stat_cache,
            tracked_files: HashSet::new(),
            tracked_dirs: HashSet::new(),
            include_set: None,
            exclude_set: None,
            fsw: None,
            dirty: false,
        }
    }

    /// Run the watch loop until cancellation. Falls back to polling-only
    /// when filesystem-event subscription is unavailable.
    pub async fn run(mut self) {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WatchMsg>();

        let fsw = RecommendedWatcher::new(
            {
                let event_tx = event_tx.clone();
                move |res: notify::Result<Event>| {
                    let msg = match res {
                        Ok(event) => WatchMsg::Event(event),
                        Err(_) => WatchMsg::Error,
                    };
                    let _ = event_tx.send(msg);
                }
            },
            Config::default(),
        );

        match fsw {
            Ok(fsw) => {
                self.fsw = Some(fsw);
                self.run_hybrid(event_rx).await;
            }
            Err(err) => {
                warn!(error = %err, "filesystem events unavailable, falling back to polling");
                self.run_poll_only().await;
            }
        }
    }

    async fn run_hybrid(mut self, mut event_rx: mpsc::UnboundedReceiver<WatchMsg>) {
        if let Err(err) = self.build_file_list() {
            error!(error = %err, "initial pattern expansion failed");
            return;
        }
        info!(
            dirs = self.tracked_dirs.len(),
            files = self.tracked_files.len(),
            "watching via filesystem events"
        );

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        refresh.reset(); // first refresh one interval from now, not immediately

        let cancel = self.cancel.clone();
        let mut pending: Option<ChangeSet> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let debounce_due = sleep_until_opt(deadline);

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("watcher canceled, dropping pending changes");
                    return;
                }

                msg = event_rx.recv() => {
                    match msg {
                        Some(WatchMsg::Event(event)) => self.handle_event(event),
                        // Subscription errors and overflow force a rescan.
                        Some(WatchMsg::Error) => self.dirty = true,
                        None => return,
                    }
                }

                _ = poll.tick() => {
                    if !self.dirty {
                        continue;
                    }
                    self.dirty = false;

                    let new_sums = self.scan_tracked();
                    self.absorb(new_sums, &mut pending, &mut deadline);
                }

                _ = refresh.tick() => {
                    if let Err(err) = self.build_file_list() {
                        debug!(error = %err, "pattern refresh failed");
                        continue;
                    }
                    debug!(
                        files = self.tracked_files.len(),
                        dirs = self.tracked_dirs.len(),
                        "refreshed tracked set"
                    );
                    self.dirty = true;
                }

                _ = debounce_due => {
                    deadline = None;
                    if let Some(changes) = pending.take() {
                        if !changes.is_empty() && self.changes_tx.send(changes).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Polling-only fallback: re-expand globs every tick, no event layer.
    async fn run_poll_only(mut self) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let cancel = self.cancel.clone();
        let mut pending: Option<ChangeSet> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let debounce_due = sleep_until_opt(deadline);

            tokio::select! {
                _ = cancel.cancelled() => return,

                _ = poll.tick() => {
                    let Ok(new_sums) = self.scan_with_glob() else { continue };
                    self.absorb(new_sums, &mut pending, &mut deadline);
                }

                _ = debounce_due => {
                    deadline = None;
                    if let Some(changes) = pending.take() {
                        if !changes.is_empty() && self.changes_tx.send(changes).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Diff a fresh scan against the snapshot; merge non-empty results
    /// into the pending set and (re)arm the debounce timer.
    fn absorb(
        &mut self,
        new_sums: SumMap,
        pending: &mut Option<ChangeSet>,
        deadline: &mut Option<Instant>,
    ) {
        let changes = diff_sums(&self.sums, &new_sums);
        if changes.is_empty() {
            return;
        }

        self.sums = new_sums;

        match pending {
            Some(p) => p.merge(changes),
            None => *pending = Some(changes),
        }
        // An unrepresentable deadline (effectively infinite debounce)
        // defers delivery until cancellation.
        *deadline = Instant::now().checked_add(self.debounce);
    }

    fn handle_event(&mut self, event: Event) {
        // Metadata-only changes never alter content hashes.
        if matches!(
            event.kind,
            EventKind::Access(_) | EventKind::Modify(notify::event::ModifyKind::Metadata(_))
        ) {
            return;
        }

        let is_create = matches!(event.kind, EventKind::Create(_));

        for path in &event.paths {
            let Some(rel) = relative_str(&self.root, path) else {
                continue;
            };

            if self.tracked_files.contains(&rel) {
                self.dirty = true;
            } else if self.matches_includes(&rel) {
                self.dirty = true;
                // A newly created matching file joins the tracked set at
                // once so the next scan can classify it as added.
                if path.is_file() {
                    self.tracked_files.insert(rel.clone());
                }
            }

            if is_create && path.is_dir() {
                self.maybe_watch_dir(path, &rel);
            }
        }
    }

    fn matches_includes(&self, rel: &str) -> bool {
        let included = self
            .include_set
            .as_ref()
            .map(|s| s.is_match(rel))
            .unwrap_or(false);
        if !included {
            return false;
        }
        !self
            .exclude_set
            .as_ref()
            .map(|s| s.is_match(rel))
            .unwrap_or(false)
    }

    /// Expand globs into the tracked file set plus every ancestor
    /// directory, then sync the event subscriptions to match.
    fn build_file_list(&mut self) -> Result<()> {
        let files = expand_patterns(&self.root, &self.patterns)?;

        let mut new_files: HashSet<String> = HashSet::with_capacity(files.len());
        let mut new_dirs: HashSet<String> = HashSet::new();
        new_dirs.insert(".".to_string());

        for f in files {
            if let Some(parent) = Path::new(&f).parent() {
                let mut dir = parent.to_path_buf();
                while !dir.as_os_str().is_empty() {
                    new_dirs.insert(dir.to_string_lossy().replace('\\', "/"));
                    dir = match dir.parent() {
                        Some(p) => p.to_path_buf(),
                        None => break,
                    };
                }
            }
            new_files.insert(f);
        }

        if let Some(fsw) = self.fsw.as_mut() {
            for dir in self.tracked_dirs.difference(&new_dirs) {
                let abs = self.root.join(dir);
                let _ = fsw.unwatch(&abs);
            }
            for dir in new_dirs.difference(&self.tracked_dirs) {
                let abs = self.root.join(dir);
                if let Err(err) = fsw.watch(&abs, RecursiveMode::NonRecursive) {
                    warn!(dir = %dir, error = %err, "could not watch directory");
                } else {
                    debug!(dir = %dir, "watching directory");
                }
            }
        }

        self.tracked_files = new_files;
        self.tracked_dirs = new_dirs;
        self.include_set = compile_includes(&self.patterns).ok();
        self.exclude_set = compile_excludes(&self.patterns).ok();
        Ok(())
    }

    /// Hash the known tracked files, reusing the previous hash for files
    /// whose `(mtime, size)` is unchanged. Missing files drop out of the
    /// result and thereby classify as removed.
    fn scan_tracked(&mut self) -> SumMap {
        let mut new_stats = HashMap::with_capacity(self.tracked_files.len());
        let mut sums = SumMap::new();

        for f in &self.tracked_files {
            let full = self.root.join(f);
            let Some(st) = stat_path(&full) else {
                continue; // deleted mid-scan
            };
            new_stats.insert(f.clone(), st);

            if self.stat_cache.get(f) == Some(&st) {
                if let Some(hash) = self.sums.get(f) {
                    sums.insert(f.clone(), hash.clone());
                    continue;
                }
            }

            match hash_file(&full) {
                Ok(hash) => {
                    sums.insert(f.clone(), hash);
                }
                Err(_) => continue,
            }
        }

        self.stat_cache = new_stats;
        sums
    }

    /// Full glob re-expansion scan, used by the polling-only fallback.
    fn scan_with_glob(&mut self) -> Result<SumMap> {
        let files = expand_patterns(&self.root, &self.patterns)?;

        let mut new_stats = HashMap::with_capacity(files.len());
        let mut sums = SumMap::new();

        for f in files {
            let full = self.root.join(&f);
            let Some(st) = stat_path(&full) else {
                continue;
            };
            new_stats.insert(f.clone(), st);

            if self.stat_cache.get(&f) == Some(&st) {
                if let Some(hash) = self.sums.get(&f) {
                    sums.insert(f, hash.clone());
                    continue;
                }
            }

            match hash_file(&full) {
                Ok(hash) => {
                    sums.insert(f, hash);
                }
                Err(_) => continue,
            }
        }

        self.stat_cache = new_stats;
        Ok(sums)
    }

    /// Subscribe to a directory created under a tracked ancestor.
    fn maybe_watch_dir(&mut self, abs: &Path, rel: &str) {
        let tracked = self.tracked_dirs.contains(rel)
            || Path::new(rel).ancestors().skip(1).any(|a| {
                let a = a.to_string_lossy();
                // The empty ancestor is the root itself, tracked as ".".
                let key: &str = if a.is_empty() { "." } else { &a };
                self.tracked_dirs.contains(key)
            });
        if !tracked {
            return;
        }

        if let Some(fsw) = self.fsw.as_mut() {
            if fsw.watch(abs, RecursiveMode::NonRecursive).is_ok() {
                self.tracked_dirs.insert(rel.to_string());
                debug!(dir = %rel, "watching new directory");
            }
        }
    }
}

/// A sleep future that never resolves when no deadline is armed.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn stat_path(path: &Path) -> Option<FileStat> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(FileStat {
        mtime: meta.modified().ok()?,
        size: meta.len(),
    })
}

/// Convert an absolute event path into a root-relative, forward-slash
/// string. Returns `None` for paths outside the root.
fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}
