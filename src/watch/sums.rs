// src/watch/sums.rs

//! Sum manifest: the persisted `{path → hash}` snapshot of a watched tree,
//! and the [`ChangeSet`] diffs derived from two snapshots.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Mapping of root-relative path to content hash. The BTreeMap keeps
/// iteration (and therefore the written manifest) sorted by path.
pub type SumMap = BTreeMap<String, String>;

/// Differences between two snapshots. Each list is sorted and free of
/// duplicates; the set is empty iff all three lists are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Merge `other` into `self`. A path already present anywhere in `self`
    /// keeps its original classification; later duplicates are dropped.
    pub fn merge(&mut self, other: ChangeSet) {
        let mut seen: HashSet<&str> = HashSet::new();
        for f in self
            .added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
        {
            seen.insert(f.as_str());
        }

        let mut added: Vec<String> = Vec::new();
        let mut modified: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        for f in other.added {
            if !seen.contains(f.as_str()) {
                added.push(f);
            }
        }
        for f in other.modified {
            if !seen.contains(f.as_str()) && !added.contains(&f) {
                modified.push(f);
            }
        }
        for f in other.removed {
            if !seen.contains(f.as_str()) && !added.contains(&f) && !modified.contains(&f) {
                removed.push(f);
            }
        }

        self.added.extend(added);
        self.modified.extend(modified);
        self.removed.extend(removed);
        self.added.sort();
        self.modified.sort();
        self.removed.sort();
    }
}

/// Read a sum manifest from disk. Lines are `<path> <hash>`; blank and
/// malformed lines are ignored. A missing file yields an empty map.
pub fn read_sums(path: &Path) -> Result<SumMap> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SumMap::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("open sum file {}", path.display()));
        }
    };

    let mut entries = SumMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read sum file {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(p), Some(h), None) => {
                entries.insert(p.to_string(), h.to_string());
            }
            _ => continue,
        }
    }
    Ok(entries)
}

/// Write a sum manifest, sorted by path. The file is written to a sibling
/// temp path and renamed into place so readers never observe a partial
/// manifest.
pub fn write_sums(path: &Path, entries: &SumMap) -> Result<()> {
    let tmp = path.with_extension("sum.tmp");
    {
        let file = File::create(&tmp)
            .with_context(|| format!("create sum file {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        for (p, h) in entries {
            writeln!(writer, "{p} {h}")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("replace sum file {}", path.display()))?;
    Ok(())
}

/// Compare two snapshots. Paths only in `new` are added, paths in both with
/// differing hashes are modified, paths only in `old` are removed.
pub fn diff_sums(old: &SumMap, new: &SumMap) -> ChangeSet {
    let mut cs = ChangeSet::default();

    for (path, new_hash) in new {
        match old.get(path) {
            None => cs.added.push(path.clone()),
            Some(old_hash) if old_hash != new_hash => cs.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            cs.removed.push(path.clone());
        }
    }

    // BTreeMap iteration is already ordered, so the lists come out sorted.
    cs
}
