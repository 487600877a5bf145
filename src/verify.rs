//! Integrity Verifier: reconciles what the manifests claim with what is on
//! disk for one modality.
//!
//! Report only, no corrective action: whether to re-extract missing
//! artifacts or accept stale ones is a judgment call left to the operator.

use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::extract::count_artifacts;
use crate::ledger::{ExtractionJob, JobKind, LedgerKey};

/// Three-way diff between manifests and the output tree. The buckets are
/// disjoint; every clip id seen on either side lands in exactly one.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub consistent: Vec<String>,
    /// Manifest claims more than the disk holds: likely a partial write.
    pub manifest_excess: Vec<String>,
    /// Disk holds clips or artifacts the manifest does not claim: stale data
    /// from a previous pipeline version.
    pub disk_excess: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.manifest_excess.is_empty() && self.disk_excess.is_empty()
    }

    pub fn log_summary(&self) {
        info!(
            "Integrity: {} consistent, {} manifest-excess, {} disk-excess.",
            self.consistent.len(),
            self.manifest_excess.len(),
            self.disk_excess.len()
        );
        if !self.manifest_excess.is_empty() {
            warn!("Manifest claims not backed by disk: {}", self.manifest_excess.join(", "));
        }
        if !self.disk_excess.is_empty() {
            warn!("On-disk data absent from manifests: {}", self.disk_excess.join(", "));
        }
    }
}

/// Compare observed per-clip artifact counts against the manifests for one
/// modality, cross-checking the job ledger along the way.
pub fn verify_outputs(
    jobs: &HashMap<LedgerKey, ExtractionJob>,
    manifest_dir: &Path,
    data_dir: &Path,
    kind: JobKind,
) -> std::io::Result<IntegrityReport> {
    let observed = observe_disk(data_dir, kind)?;
    let claimed = read_manifest_claims(manifest_dir, kind)?;

    for (clip_id, &count) in &claimed {
        if let Some(job) = jobs.get(&(clip_id.clone(), kind)) {
            if kind != JobKind::VideoPassthrough && job.artifact_count != Some(count) {
                warn!(
                    "Ledger and manifest disagree for {clip_id}: ledger {:?}, manifest {count}",
                    job.artifact_count
                );
            }
        }
    }

    let mut report = IntegrityReport::default();
    let all_ids: BTreeSet<String> = observed.keys().chain(claimed.keys()).cloned().collect();
    for clip_id in &all_ids {
        let on_disk = observed.get(clip_id);
        let in_manifest = claimed.get(clip_id);
        match (on_disk, in_manifest) {
            (Some(&disk), Some(&manifest)) if disk == manifest => {
                report.consistent.push(clip_id.clone())
            }
            (Some(&disk), Some(&manifest)) if manifest > disk => {
                report.manifest_excess.push(clip_id.clone())
            }
            (Some(_), Some(_)) | (Some(_), None) => report.disk_excess.push(clip_id.clone()),
            (None, Some(_)) => report.manifest_excess.push(clip_id.clone()),
            (None, None) => unreachable!(),
        }
    }
    Ok(report)
}

/// Count artifacts per clip directory under the modality root.
fn observe_disk(data_dir: &Path, kind: JobKind) -> std::io::Result<BTreeMap<String, usize>> {
    let mut observed = BTreeMap::new();

    if kind == JobKind::VideoPassthrough {
        // Whole videos: one file per clip, presence is the artifact.
        for entry in WalkDir::new(data_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    observed.insert(stem.to_string(), 1);
                }
            }
        }
        return Ok(observed);
    }

    let root = data_dir.join(kind.as_str());
    if !root.exists() {
        return Ok(observed);
    }
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(clip_id) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        observed.insert(clip_id, count_artifacts(&entry.path(), kind)?);
    }
    Ok(observed)
}

/// Fold every `*_<modality>.txt` manifest in the directory into per-clip
/// claimed counts. Split manifests overlap with the full one by design; the
/// counts agree, so folding is harmless.
fn read_manifest_claims(
    manifest_dir: &Path,
    kind: JobKind,
) -> std::io::Result<BTreeMap<String, usize>> {
    let mut claimed = BTreeMap::new();
    let suffix = format!("_{}.txt", kind.as_str());

    if !manifest_dir.exists() {
        return Ok(claimed);
    }
    for entry in fs::read_dir(manifest_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(&suffix) {
            continue;
        }
        let content = fs::read_to_string(entry.path())?;
        for line in content.lines() {
            let mut cols = line.split_whitespace();
            let Some(first) = cols.next() else { continue };
            match kind {
                JobKind::VideoPassthrough => {
                    if let Some(stem) = Path::new(first).file_stem().and_then(|s| s.to_str()) {
                        claimed.insert(stem.to_string(), 1);
                    }
                }
                _ => {
                    if let Some(count) = cols.next().and_then(|c| c.parse::<usize>().ok()) {
                        claimed.insert(first.to_string(), count);
                    }
                }
            }
        }
    }
    Ok(claimed)
}
