//! The persisted job ledger: one JSON record per line, appended as workers
//! retire jobs, re-read on the next run to make reruns cheap and safe.
//!
//! The ledger is the only cross-run shared state in the pipeline. Each entry
//! is owned by exactly one worker, so the writer only needs append-safety,
//! not record-level locking.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What kind of artifact a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Frames,
    Flow,
    VideoPassthrough,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Frames => "frames",
            JobKind::Flow => "flow",
            JobKind::VideoPassthrough => "videos",
        }
    }
}

/// Job lifecycle state. Transitions are monotonic: a job never regresses
/// from `Done`/`Skipped` back to `Pending` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Skipped)
    }

    /// Done this run, or done in a prior run and skipped in this one.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Skipped)
    }
}

/// One extraction job, created by the scheduler and retired exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub clip_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub output_path: PathBuf,
    pub artifact_count: Option<usize>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl ExtractionJob {
    pub fn pending(clip_id: impl Into<String>, kind: JobKind, output_path: PathBuf) -> Self {
        Self {
            clip_id: clip_id.into(),
            kind,
            status: JobStatus::Pending,
            output_path,
            artifact_count: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn key(&self) -> LedgerKey {
        (self.clip_id.clone(), self.kind)
    }
}

pub type LedgerKey = (String, JobKind);

/// Fold a ledger file into its latest state per (clip_id, kind).
///
/// A missing file is an empty ledger. A truncated trailing line (from an
/// interrupted run) is tolerated with a warning; the entry it would have
/// recorded is simply retried.
pub fn load_ledger(path: &Path) -> std::io::Result<HashMap<LedgerKey, ExtractionJob>> {
    let mut jobs = HashMap::new();
    if !path.exists() {
        return Ok(jobs);
    }

    let reader = BufReader::new(File::open(path)?);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExtractionJob>(&line) {
            Ok(job) => {
                jobs.insert(job.key(), job);
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable ledger line {} in {}: {}",
                    lineno + 1,
                    path.display(),
                    e
                );
            }
        }
    }
    Ok(jobs)
}

/// Append-only ledger writer shared across workers.
///
/// Every record is flushed immediately so a terminal state is durable as
/// soon as the owning worker reports it.
pub struct LedgerWriter {
    inner: Mutex<BufWriter<File>>,
}

impl LedgerWriter {
    pub fn append(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn record(&self, job: &ExtractionJob) -> std::io::Result<()> {
        let line = serde_json::to_string(job)?;
        let mut writer = self.inner.lock().expect("ledger writer poisoned");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn job(clip_id: &str, kind: JobKind, status: JobStatus, count: Option<usize>) -> ExtractionJob {
        ExtractionJob {
            clip_id: clip_id.to_string(),
            kind,
            status,
            output_path: PathBuf::from(format!("out/{clip_id}")),
            artifact_count: count,
            error: None,
            attempts: 1,
        }
    }

    #[test]
    fn missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = load_ledger(&dir.path().join("nope.jsonl")).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn roundtrip_and_later_line_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let writer = LedgerWriter::append(&path).unwrap();

        writer
            .record(&job("a", JobKind::Frames, JobStatus::Failed, None))
            .unwrap();
        writer
            .record(&job("a", JobKind::Frames, JobStatus::Done, Some(120)))
            .unwrap();
        writer
            .record(&job("a", JobKind::Flow, JobStatus::Done, Some(119)))
            .unwrap();
        drop(writer);

        let jobs = load_ledger(&path).unwrap();
        assert_eq!(jobs.len(), 2);
        let frames = &jobs[&("a".to_string(), JobKind::Frames)];
        assert_eq!(frames.status, JobStatus::Done);
        assert_eq!(frames.artifact_count, Some(120));
    }

    #[test]
    fn truncated_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let writer = LedgerWriter::append(&path).unwrap();
        writer
            .record(&job("a", JobKind::Frames, JobStatus::Done, Some(10)))
            .unwrap();
        drop(writer);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"clip_id\": \"b\", \"kind\"").unwrap();
        drop(file);

        let jobs = load_ledger(&path).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs.contains_key(&("a".to_string(), JobKind::Frames)));
    }
}
