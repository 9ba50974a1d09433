//! rsync output parsing and the on-disk progress files the UI polls.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::SyncStatus;
use super::rsync::FILE_MARKER;
use crate::util::atomic_write;

static PROGRESS2_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*([\d,.]+)\s+(\d{1,3})%\s+(\S+/s)\s+(\d+:\d{2}:\d{2})(?:\s+\(xfr#(\d+),\s*(?:to|ir)-chk=(\d+)/(\d+)\))?",
    )
    .expect("progress regex is a valid static pattern")
});

/// One `--info=progress2` record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub bytes: u64,
    pub percent: u8,
    pub rate: String,
    pub eta: String,
    pub transfers: Option<u64>,
    pub to_check: Option<u64>,
    pub total: Option<u64>,
}

/// What a single line of rsync output means to us.
#[derive(Debug, Clone, PartialEq)]
pub enum RsyncLine {
    Progress(ProgressSample),
    File(String),
    Other(String),
}

pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let caps = PROGRESS2_RE.captures(line)?;
    let bytes = caps[1].replace([',', '.'], "").parse().ok()?;
    let percent: u8 = caps[2].parse().ok()?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());
    Some(ProgressSample {
        bytes,
        percent: percent.min(100),
        rate: caps[3].to_string(),
        eta: caps[4].to_string(),
        transfers: num(5),
        to_check: num(6),
        total: num(7),
    })
}

pub fn classify_line(line: &str) -> RsyncLine {
    if let Some(name) = line.trim_start().strip_prefix(FILE_MARKER) {
        return RsyncLine::File(name.trim_end().to_string());
    }
    match parse_progress_line(line) {
        Some(sample) => RsyncLine::Progress(sample),
        None => RsyncLine::Other(line.to_string()),
    }
}

/// Splits a byte stream into lines on both `\n` and `\r`; rsync redraws its
/// progress record with bare carriage returns.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).to_string());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(line)
    }
}

/// Snapshot of a run, persisted as `<progress_dir>/<run_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub run_id: i64,
    pub target: String,
    pub status: SyncStatus,
    pub percent: u8,
    pub bytes_transferred: u64,
    pub rate: Option<String>,
    pub eta: Option<String>,
    pub files_transferred: u64,
    pub current_file: Option<String>,
    pub to_check: Option<u64>,
    pub total_files: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl SyncProgress {
    pub fn new(run_id: i64, target: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            target: target.to_string(),
            status: SyncStatus::Queued,
            percent: 0,
            bytes_transferred: 0,
            rate: None,
            eta: None,
            files_transferred: 0,
            current_file: None,
            to_check: None,
            total_files: None,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Fold one parsed line into the snapshot. Returns `true` when a new file
    /// finished, which callers treat as worth persisting immediately.
    pub fn apply(&mut self, line: &RsyncLine) -> bool {
        let file_done = match line {
            RsyncLine::Progress(sample) => {
                self.percent = sample.percent;
                self.bytes_transferred = sample.bytes;
                self.rate = Some(sample.rate.clone());
                self.eta = Some(sample.eta.clone());
                if sample.to_check.is_some() {
                    self.to_check = sample.to_check;
                    self.total_files = sample.total;
                }
                false
            }
            RsyncLine::File(name) if !name.ends_with('/') => {
                self.files_transferred += 1;
                self.current_file = Some(name.clone());
                true
            }
            RsyncLine::File(_) | RsyncLine::Other(_) => false,
        };
        self.updated_at = Utc::now();
        file_done
    }

    pub fn finish(&mut self, status: SyncStatus, error: Option<String>) {
        self.status = status;
        if status == SyncStatus::Completed {
            self.percent = 100;
            self.eta = None;
        }
        self.error = error;
        self.updated_at = Utc::now();
    }
}

/// Directory of per-run progress files.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: i64) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub fn write(&self, progress: &SyncProgress) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(progress).context("Failed to serialize sync progress")?;
        atomic_write(&self.path_for(progress.run_id), &json)
    }

    pub fn read(&self, run_id: i64) -> Result<Option<SyncProgress>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read(&path)
            .with_context(|| format!("Failed to read progress file {}", path.display()))?;
        let progress = serde_json::from_slice(&contents)
            .with_context(|| format!("Corrupt progress file {}", path.display()))?;
        Ok(Some(progress))
    }

    /// All readable progress files, newest run first. Unreadable files are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<SyncProgress>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut all = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let entry = entry?;
            let Some(run_id) = run_id_from_path(&entry.path()) else {
                continue;
            };
            match self.read(run_id) {
                Ok(Some(progress)) => all.push(progress),
                Ok(None) => {}
                Err(e) => tracing::warn!(run_id, error = %format!("{:#}", e), "skipping progress file"),
            }
        }
        all.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(all)
    }

    pub fn remove(&self, run_id: i64) -> Result<bool> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    /// Keep the newest `keep` finished runs; running ones are never pruned.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let finished: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|p| p.status.is_terminal())
            .collect();
        let mut removed = 0;
        for progress in finished.iter().skip(keep) {
            if self.remove(progress.run_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn run_id_from_path(path: &Path) -> Option<i64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
