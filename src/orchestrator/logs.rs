// src/orchestrator/logs.rs

//! Log-file reads backing the `/targets/{name}/logs` endpoint: tail the
//! last N lines, or return an offset/limit line range with a total count.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

/// Files smaller than this are read in full for tailing.
const SMALL_FILE_LIMIT: u64 = 1024 * 1024;

/// Chunk read from the end of large files when tailing.
const TAIL_CHUNK: u64 = 256 * 1024;

/// Read the last `n` lines of a file.
pub fn tail_file(path: &Path, n: usize) -> Result<Vec<String>> {
    let mut file =
        File::open(path).with_context(|| format!("open log file {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat log file {}", path.display()))?
        .len();

    if size == 0 {
        return Ok(Vec::new());
    }

    if size < SMALL_FILE_LIMIT {
        let mut lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;
        if lines.len() > n {
            lines.drain(..lines.len() - n);
        }
        return Ok(lines);
    }

    // Large file: read only a trailing chunk and split from the end.
    let chunk = TAIL_CHUNK.min(size);
    file.seek(SeekFrom::Start(size - chunk))?;
    let mut buf = Vec::with_capacity(chunk as usize);
    file.read_to_end(&mut buf)?;

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text
        .trim_end_matches('\n')
        .split('\n')
        .map(str::to_string)
        .collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

/// Read `limit` lines starting at line `offset` (zero-based). Returns the
/// selected lines and the total line count of the file. A zero limit
/// returns no lines, which is useful for fetching just the total.
pub fn read_line_range(path: &Path, offset: usize, limit: usize) -> Result<(Vec<String>, usize)> {
    let file =
        File::open(path).with_context(|| format!("open log file {}", path.display()))?;

    let mut lines = Vec::new();
    let mut total = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if limit > 0 && total >= offset && total < offset + limit {
            lines.push(line);
        }
        total += 1;
    }
    Ok((lines, total))
}
