//! Manifest Generator: turns the canonical index plus the terminal job
//! ledger into flat-file listings for the training loader.
//!
//! Entries are sorted by clip_id ascending, independent of job completion
//! order, so reruns over identical inputs produce byte-identical files. A
//! clip without a successful terminal job for a modality is omitted from
//! that manifest and listed in the exclusion report instead.

use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::config::ExtractionMode;
use crate::error::PipelineError;
use crate::ledger::{ExtractionJob, JobKind, LedgerKey};
use crate::types::{CanonicalClip, CanonicalIndex, LabelVocab, Split};

#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Manifest file prefix, typically the dataset name.
    pub dataset: String,
    pub manifest_dir: PathBuf,
    /// Root the whole-video manifest paths are made relative to.
    pub src_root: Option<PathBuf>,
    pub splits: Vec<Split>,
    pub mode: ExtractionMode,
}

/// A clip omitted from one modality's manifests, with the reason.
#[derive(Debug, Clone)]
pub struct ExcludedClip {
    pub clip_id: String,
    pub modality: JobKind,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ManifestReport {
    pub written: Vec<PathBuf>,
    pub entries: usize,
    pub excluded: Vec<ExcludedClip>,
    /// Per-modality write failures; the remaining modalities still complete.
    pub errors: Vec<PipelineError>,
}

impl ManifestReport {
    pub fn log_summary(&self) {
        info!(
            "Wrote {} manifest file(s), {} entries.",
            self.written.len(),
            self.entries
        );
        if !self.excluded.is_empty() {
            warn!("{} clips excluded from manifests:", self.excluded.len());
            for excluded in &self.excluded {
                warn!(
                    "  {} ({}): {}",
                    excluded.clip_id,
                    excluded.modality.as_str(),
                    excluded.reason
                );
            }
        }
    }
}

/// Encode a clip's labels as ascending vocabulary indices joined by commas.
pub fn encode_labels(clip: &CanonicalClip, vocab: &LabelVocab) -> String {
    let mut indices: Vec<usize> = clip
        .labels
        .iter()
        .filter_map(|label| vocab.index_of(label))
        .collect();
    indices.sort_unstable();
    indices
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Write one manifest per requested split and modality.
///
/// Derivation is pure: index + terminal jobs in, files out; the generator
/// can be rerun at any time and owes nothing to completion order.
pub fn write_manifests(
    index: &CanonicalIndex,
    vocab: &LabelVocab,
    jobs: &HashMap<LedgerKey, ExtractionJob>,
    config: &ManifestConfig,
) -> Result<ManifestReport, PipelineError> {
    std::fs::create_dir_all(&config.manifest_dir)?;
    let mut report = ManifestReport::default();

    for &kind in config.mode.job_kinds() {
        // Eligibility is per clip and modality, not per split, so each
        // exclusion is reported exactly once.
        let mut eligible: BTreeMap<&str, (Split, String)> = BTreeMap::new();
        for (clip_id, clip) in index.iter() {
            match eligibility(clip, kind, jobs, vocab, config) {
                Ok(line) => {
                    eligible.insert(clip_id.as_str(), (clip.split, line));
                }
                Err(reason) => report.excluded.push(ExcludedClip {
                    clip_id: clip_id.clone(),
                    modality: kind,
                    reason,
                }),
            }
        }

        for &split in &config.splits {
            let path = config.manifest_dir.join(format!(
                "{}_{}_{}.txt",
                config.dataset,
                split.as_str(),
                kind.as_str()
            ));
            match write_one(&path, split, &eligible) {
                Ok(entries) => {
                    report.entries += entries;
                    report.written.push(path);
                }
                Err(e) => {
                    report.errors.push(PipelineError::ManifestWrite {
                        modality: kind.as_str().to_string(),
                        source: e,
                    });
                    break;
                }
            }
        }
    }
    Ok(report)
}

/// The manifest line for a clip in one modality, or the exclusion reason.
fn eligibility(
    clip: &CanonicalClip,
    kind: JobKind,
    jobs: &HashMap<LedgerKey, ExtractionJob>,
    vocab: &LabelVocab,
    config: &ManifestConfig,
) -> Result<String, String> {
    if clip.split == Split::Unassigned {
        return Err("clip has no split assignment".to_string());
    }
    let job = jobs
        .get(&(clip.clip_id.clone(), kind))
        .ok_or_else(|| format!("no {} extraction job", kind.as_str()))?;
    if !job.status.is_success() {
        return Err(match &job.error {
            Some(error) => format!("extraction failed: {error}"),
            None => "extraction did not complete".to_string(),
        });
    }

    let labels = encode_labels(clip, vocab);
    Ok(match kind {
        JobKind::VideoPassthrough => {
            let rel = config
                .src_root
                .as_deref()
                .and_then(|root| clip.source_path.strip_prefix(root).ok())
                .unwrap_or(&clip.source_path);
            format!("{} {labels}", rel.display())
        }
        _ => format!(
            "{} {} {labels}",
            clip.clip_id,
            job.artifact_count.unwrap_or(0)
        ),
    })
}

fn write_one(
    path: &std::path::Path,
    split: Split,
    eligible: &BTreeMap<&str, (Split, String)>,
) -> std::io::Result<usize> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut entries = 0usize;
    for (clip_split, line) in eligible.values() {
        let member = match split {
            Split::Full => matches!(clip_split, Split::Train | Split::Val | Split::Test),
            other => *clip_split == other,
        };
        if member {
            writeln!(writer, "{line}")?;
            entries += 1;
        }
    }
    writer.flush()?;
    Ok(entries)
}
