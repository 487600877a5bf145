//! Annotation Normalizer: parses dataset-specific raw annotation sources
//! into the canonical clip index and the label vocabulary.
//!
//! Each supported schema is a variant of [`AnnotationSchema`], selected by
//! explicit configuration, never by runtime sniffing. Records from multiple
//! sources are merged by clip_id: labels unioned, segments concatenated,
//! contradictory non-mergeable fields reported as conflicts.

use log::{info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DuplicateClipConflict, SchemaMismatch};
use crate::types::{CanonicalClip, CanonicalIndex, LabelVocab, Segment, Split};

/// The closed set of raw annotation layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationSchema {
    /// Delimited text, fixed columns: path, label, optional split.
    SingleLabelList { delimiter: char },
    /// JSON object mapping clip_id to a record with a `labels` array.
    MultiLabelList,
    /// JSON object mapping clip_id to nested temporal annotations.
    TemporalSegmentJson,
    /// Plain-text index of relative paths whose first component is the class
    /// name; the declared split applies to every record in the file.
    SplitIndexClassFolders { split: Split },
}

/// One raw annotation file plus its declared schema variant.
#[derive(Debug, Clone)]
pub struct AnnotationSource {
    pub path: PathBuf,
    pub schema: AnnotationSchema,
}

/// Everything the normalizer has to report besides the index itself.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub records_seen: usize,
    pub records_merged: usize,
    pub schema_errors: Vec<SchemaMismatch>,
    pub merge_conflicts: Vec<DuplicateClipConflict>,
}

impl NormalizeReport {
    pub fn log_summary(&self) {
        info!(
            "Normalized {} records ({} merged by clip_id).",
            self.records_seen, self.records_merged
        );
        if !self.schema_errors.is_empty() {
            warn!("{} records failed schema parsing:", self.schema_errors.len());
            for err in &self.schema_errors {
                warn!("  {err}");
            }
        }
        if !self.merge_conflicts.is_empty() {
            warn!("{} merge conflicts:", self.merge_conflicts.len());
            for conflict in &self.merge_conflicts {
                warn!("  {conflict}");
            }
        }
    }
}

/// Parse every source, merge by clip_id, and build the vocabulary.
///
/// Parsing failures never abort the run: the result is a partial index plus
/// the error lists in the report.
pub fn normalize_sources(
    sources: &[AnnotationSource],
) -> (CanonicalIndex, LabelVocab, NormalizeReport) {
    // Parse sources in parallel; each yields its clips in file order.
    let parsed: Vec<(Vec<CanonicalClip>, Vec<SchemaMismatch>)> = sources
        .par_iter()
        .map(parse_source)
        .collect();

    let mut index = CanonicalIndex::new();
    let mut report = NormalizeReport::default();

    for (clips, errors) in parsed {
        report.schema_errors.extend(errors);
        for clip in clips {
            report.records_seen += 1;
            merge_clip(&mut index, clip, &mut report);
        }
    }

    let vocab = LabelVocab::build(&index);
    info!(
        "Canonical index holds {} clips over {} labels.",
        index.len(),
        vocab.len()
    );
    (index, vocab, report)
}

/// Merge one parsed record into the index.
///
/// Labels are unioned preserving first-seen order, segments concatenated,
/// hints filled from whichever side has them. Differing non-mergeable fields
/// are conflicts; the existing record wins.
fn merge_clip(index: &mut CanonicalIndex, clip: CanonicalClip, report: &mut NormalizeReport) {
    use std::collections::btree_map::Entry;

    let existing = match index.entry(clip.clip_id.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(clip);
            return;
        }
        Entry::Occupied(slot) => slot.into_mut(),
    };
    report.records_merged += 1;

    // Non-mergeable fields that differ are conflicts; the existing record
    // wins and the new one is discarded entirely.
    let conflicting_field = if existing.source_path != clip.source_path {
        Some("source_path")
    } else if matches!(
        (existing.duration_hint, clip.duration_hint),
        (Some(a), Some(b)) if (a - b).abs() > 1e-6
    ) {
        Some("duration_hint")
    } else if existing.split != Split::Unassigned
        && clip.split != Split::Unassigned
        && existing.split != clip.split
    {
        Some("split")
    } else {
        None
    };
    if let Some(field) = conflicting_field {
        report.merge_conflicts.push(DuplicateClipConflict {
            clip_id: clip.clip_id,
            field: field.to_string(),
        });
        return;
    }

    for label in &clip.labels {
        existing.push_label(label);
    }
    existing.segments.extend(clip.segments.iter().copied());
    if existing.duration_hint.is_none() {
        existing.duration_hint = clip.duration_hint;
    }
    if existing.fps_hint.is_none() {
        existing.fps_hint = clip.fps_hint;
    }
    if existing.split == Split::Unassigned {
        existing.split = clip.split;
    }
}

fn parse_source(source: &AnnotationSource) -> (Vec<CanonicalClip>, Vec<SchemaMismatch>) {
    match &source.schema {
        AnnotationSchema::SingleLabelList { delimiter } => {
            parse_single_label_list(&source.path, *delimiter)
        }
        AnnotationSchema::MultiLabelList => parse_multi_label_list(&source.path),
        AnnotationSchema::TemporalSegmentJson => parse_temporal_segments(&source.path),
        AnnotationSchema::SplitIndexClassFolders { split } => {
            parse_class_folders(&source.path, *split)
        }
    }
}

fn mismatch(path: &Path, context: impl Into<String>, message: impl Into<String>) -> SchemaMismatch {
    SchemaMismatch {
        file: path.display().to_string(),
        context: context.into(),
        message: message.into(),
    }
}

/// Derive a stable clip_id from a media path: the file stem.
fn clip_id_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(String::from)
}

fn read_lines(path: &Path) -> Result<Vec<String>, SchemaMismatch> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(String::from).collect())
        .map_err(|e| mismatch(path, "-", format!("failed to read file: {e}")))
}

fn parse_single_label_list(path: &Path, delimiter: char) -> (Vec<CanonicalClip>, Vec<SchemaMismatch>) {
    let mut clips = Vec::new();
    let mut errors = Vec::new();
    let lines = match read_lines(path) {
        Ok(lines) => lines,
        Err(e) => return (clips, vec![e]),
    };

    for (lineno, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let context = format!("line {}", lineno + 1);
        let mut cols = line.split(delimiter);
        let (Some(rel_path), Some(label)) = (cols.next(), cols.next()) else {
            errors.push(mismatch(path, context, "expected path, label[, split] columns"));
            continue;
        };
        let label = label.trim();
        if label.is_empty() {
            errors.push(mismatch(path, context, "empty label column"));
            continue;
        }
        let rel_path = PathBuf::from(rel_path.trim());
        let Some(clip_id) = clip_id_from_path(&rel_path) else {
            errors.push(mismatch(path, context, "path column has no file stem"));
            continue;
        };

        let mut clip = CanonicalClip::new(clip_id, rel_path);
        clip.push_label(label);
        if let Some(split_col) = cols.next() {
            match Split::parse(split_col) {
                Some(split) => clip.split = split,
                None => {
                    errors.push(mismatch(
                        path,
                        context,
                        format!("unknown split token '{}'", split_col.trim()),
                    ));
                    continue;
                }
            }
        }
        clips.push(clip);
    }
    (clips, errors)
}

#[derive(Debug, Deserialize)]
struct MultiLabelRecord {
    #[serde(default)]
    path: Option<String>,
    labels: Vec<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    split: Option<String>,
}

fn parse_multi_label_list(path: &Path) -> (Vec<CanonicalClip>, Vec<SchemaMismatch>) {
    let mut clips = Vec::new();
    let mut errors = Vec::new();

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => return (clips, vec![mismatch(path, "-", format!("failed to open: {e}"))]),
    };
    let records: HashMap<String, MultiLabelRecord> = match serde_json::from_reader(file) {
        Ok(records) => records,
        Err(e) => return (clips, vec![mismatch(path, "-", format!("invalid JSON: {e}"))]),
    };

    // HashMap order is arbitrary; sort so repeated runs see records in the
    // same order before merging.
    let mut records: Vec<_> = records.into_iter().collect();
    records.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (clip_id, record) in records {
        if record.labels.is_empty() {
            errors.push(mismatch(path, clip_id.as_str(), "record has no labels"));
            continue;
        }
        let source_path = record
            .path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{clip_id}.mp4")));
        let mut clip = CanonicalClip::new(clip_id, source_path);
        for label in &record.labels {
            clip.push_label(label);
        }
        clip.duration_hint = record.duration;
        clip.fps_hint = record.fps;
        if let Some(split_token) = record.split {
            match Split::parse(&split_token) {
                Some(split) => clip.split = split,
                None => {
                    errors.push(mismatch(
                        path,
                        clip.clip_id.as_str(),
                        format!("unknown split token '{split_token}'"),
                    ));
                    continue;
                }
            }
        }
        clips.push(clip);
    }
    (clips, errors)
}

#[derive(Debug, Deserialize)]
struct SegmentRecord {
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    subset: Option<String>,
    annotations: Vec<SegmentAnnotation>,
}

#[derive(Debug, Deserialize)]
struct SegmentAnnotation {
    label: String,
    segment: Vec<f64>,
}

fn parse_temporal_segments(path: &Path) -> (Vec<CanonicalClip>, Vec<SchemaMismatch>) {
    let mut clips = Vec::new();
    let mut errors = Vec::new();

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => return (clips, vec![mismatch(path, "-", format!("failed to open: {e}"))]),
    };
    let records: HashMap<String, SegmentRecord> = match serde_json::from_reader(file) {
        Ok(records) => records,
        Err(e) => return (clips, vec![mismatch(path, "-", format!("invalid JSON: {e}"))]),
    };

    let mut records: Vec<_> = records.into_iter().collect();
    records.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (clip_id, record) in records {
        let mut clip = CanonicalClip::new(clip_id.clone(), format!("{clip_id}.mp4"));
        clip.duration_hint = record.duration;
        clip.fps_hint = record.fps;
        if let Some(subset) = record.subset {
            match Split::parse(&subset) {
                Some(split) => clip.split = split,
                None => {
                    errors.push(mismatch(
                        path,
                        clip_id.as_str(),
                        format!("unknown subset token '{subset}'"),
                    ));
                    continue;
                }
            }
        }

        let mut bad_segment = false;
        for annotation in &record.annotations {
            if annotation.segment.len() != 2 || annotation.segment[0] > annotation.segment[1] {
                errors.push(mismatch(
                    path,
                    clip_id.as_str(),
                    format!("malformed segment {:?}", annotation.segment),
                ));
                bad_segment = true;
                break;
            }
            clip.push_label(&annotation.label);
            clip.segments.push(Segment {
                start: annotation.segment[0],
                end: annotation.segment[1],
            });
        }
        if bad_segment || clip.labels.is_empty() {
            if clip.labels.is_empty() && !bad_segment {
                errors.push(mismatch(path, clip_id.as_str(), "record has no annotations"));
            }
            continue;
        }
        clips.push(clip);
    }
    (clips, errors)
}

fn parse_class_folders(path: &Path, split: Split) -> (Vec<CanonicalClip>, Vec<SchemaMismatch>) {
    let mut clips = Vec::new();
    let mut errors = Vec::new();
    let lines = match read_lines(path) {
        Ok(lines) => lines,
        Err(e) => return (clips, vec![e]),
    };

    for (lineno, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let context = format!("line {}", lineno + 1);
        // Some index files carry a trailing numeric class id; the class name
        // comes from the parent directory either way.
        let rel_path = PathBuf::from(line.split_whitespace().next().unwrap_or(line));
        let class = rel_path
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str())
            .map(String::from);
        let Some(class) = class.filter(|c| !c.is_empty()) else {
            errors.push(mismatch(path, context, "path has no class directory component"));
            continue;
        };
        let Some(clip_id) = clip_id_from_path(&rel_path) else {
            errors.push(mismatch(path, context, "path has no file stem"));
            continue;
        };

        let mut clip = CanonicalClip::new(clip_id, rel_path);
        clip.push_label(&class);
        clip.split = split;
        clips.push(clip);
    }
    (clips, errors)
}
