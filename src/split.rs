//! Split Partitioner: applies split-index files to the canonical index and
//! enforces disjointness of train/val/test.
//!
//! A clip with an explicit split hint from its annotation source keeps it;
//! otherwise the split-index mapping applies. A clip claimed by neither
//! lands in the `unassigned` sentinel and is reported, never defaulted to
//! train.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::PipelineError;
use crate::types::{CanonicalIndex, Split};

/// A split index file: one clip_id (or `clip_id,split`) per line. The
/// file-level split applies to lines without their own split column.
#[derive(Debug, Clone)]
pub struct SplitFile {
    pub path: PathBuf,
    pub split: Split,
}

#[derive(Debug, Default)]
pub struct SplitReport {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    pub unassigned: Vec<String>,
}

impl SplitReport {
    pub fn log_summary(&self) {
        info!(
            "Split assignment: {} train, {} val, {} test.",
            self.train, self.val, self.test
        );
        if !self.unassigned.is_empty() {
            warn!(
                "{} clips are in no split index and were left unassigned: {}",
                self.unassigned.len(),
                self.unassigned.join(", ")
            );
        }
    }
}

/// Assign every clip in the index exactly one split.
///
/// Returns `SplitOverlap` when the split files claim a clip_id for more than
/// one of train/val/test; that is a systemic input problem, not a per-record
/// one.
pub fn assign_splits(
    index: &mut CanonicalIndex,
    split_files: &[SplitFile],
) -> Result<SplitReport, PipelineError> {
    let claims = load_claims(split_files)?;

    let mut report = SplitReport::default();
    for clip in index.values_mut() {
        if clip.split == Split::Unassigned {
            if let Some(&split) = claims.get(&clip.clip_id) {
                clip.split = split;
            }
        } else if let Some(&claimed) = claims.get(&clip.clip_id) {
            if claimed != clip.split {
                debug!(
                    "clip {}: split index says {} but source hint {} wins",
                    clip.clip_id,
                    claimed.as_str(),
                    clip.split.as_str()
                );
            }
        }
        match clip.split {
            Split::Train => report.train += 1,
            Split::Val => report.val += 1,
            Split::Test => report.test += 1,
            Split::Full | Split::Unassigned => {
                clip.split = Split::Unassigned;
                report.unassigned.push(clip.clip_id.clone());
            }
        }
    }
    Ok(report)
}

/// Load the clip_id → split mapping, rejecting overlapping claims.
fn load_claims(split_files: &[SplitFile]) -> Result<HashMap<String, Split>, PipelineError> {
    let mut claims: HashMap<String, Split> = HashMap::new();
    let mut overlaps: Vec<String> = Vec::new();

    for file in split_files {
        let content = fs::read_to_string(&file.path)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (clip_id, split) = match line.split_once(',') {
                Some((id, token)) => {
                    let split = Split::parse(token).unwrap_or(file.split);
                    (id.trim().to_string(), split)
                }
                None => (line.to_string(), file.split),
            };
            match claims.get(&clip_id) {
                Some(&existing) if existing != split => overlaps.push(clip_id),
                _ => {
                    claims.insert(clip_id, split);
                }
            }
        }
    }

    if overlaps.is_empty() {
        Ok(claims)
    } else {
        overlaps.sort();
        overlaps.dedup();
        Err(PipelineError::SplitOverlap { clip_ids: overlaps })
    }
}
