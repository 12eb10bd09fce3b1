// src/watch/hash.rs

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::watch::patterns::{expand_patterns, Pattern};
use crate::watch::sums::SumMap;

/// Number of hex characters kept from the SHA-256 digest. Chosen for
/// brevity in the manifest, not adversarial collision resistance.
const HASH_LEN: usize = 7;

/// Compute the content fingerprint of the file at `path`: the first 7 hex
/// characters of its SHA-256. Deterministic on content alone; metadata has
/// no effect.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("hash {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(HASH_LEN + 1);
    for b in digest.iter().take(HASH_LEN / 2 + 1) {
        hex.push_str(&format!("{b:02x}"));
    }
    hex.truncate(HASH_LEN);
    Ok(hex)
}

/// Expand the watch patterns and hash every matching file.
///
/// Files that vanish or cannot be read mid-scan are skipped; they either
/// reappear or classify as removed on the next scan.
pub fn scan_files(root: &Path, patterns: &[Pattern]) -> Result<SumMap> {
    let files = expand_patterns(root, patterns)?;

    let mut sums = SumMap::new();
    for f in files {
        match hash_file(&root.join(&f)) {
            Ok(h) => {
                sums.insert(f, h);
            }
            Err(_) => continue,
        }
    }
    Ok(sums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_is_seven_lowercase_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "hello").unwrap();

        let h = hash_file(&path).unwrap();
        assert_eq!(h.len(), 7);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // sha256("hello") = 2cf24db...
        assert_eq!(h, "2cf24db");
    }

    #[test]
    fn hash_depends_on_content_not_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();

        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file(&dir.path().join("nope")).is_err());
    }
}
