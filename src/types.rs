use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Partition assignment for a clip.
///
/// `Unassigned` is a reported sentinel, never a default: a clip whose id is
/// missing from a required split index lands here and is excluded from every
/// manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
    Full,
    Unassigned,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
            Split::Full => "full",
            Split::Unassigned => "unassigned",
        }
    }

    /// Parse a split token as it appears in annotation and index files.
    pub fn parse(token: &str) -> Option<Split> {
        match token.trim() {
            "train" | "training" => Some(Split::Train),
            "val" | "validation" => Some(Split::Val),
            "test" | "testing" => Some(Split::Test),
            "full" => Some(Split::Full),
            _ => None,
        }
    }
}

// Temporal extent of one annotation, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

/// The invariant clip entity shared across all dataset schemas.
///
/// Created by the normalizer, split-assigned by the partitioner, read-only
/// afterward. `labels` keeps first-seen order from the source files; the
/// numeric encoding is resolved later through [`LabelVocab`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalClip {
    pub clip_id: String,
    pub source_path: PathBuf,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
    pub split: Split,
    pub duration_hint: Option<f64>,
    pub fps_hint: Option<f64>,
}

impl CanonicalClip {
    pub fn new(clip_id: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            clip_id: clip_id.into(),
            source_path: source_path.into(),
            labels: Vec::new(),
            segments: Vec::new(),
            split: Split::Unassigned,
            duration_hint: None,
            fps_hint: None,
        }
    }

    /// Append a label unless the clip already carries it. Order is insertion
    /// order; labels are never reordered implicitly.
    pub fn push_label(&mut self, label: &str) {
        if !self.labels.iter().any(|l| l == label) {
            self.labels.push(label.to_string());
        }
    }
}

/// The canonical index. A BTreeMap so that every downstream iteration is
/// clip_id ascending without re-sorting.
pub type CanonicalIndex = BTreeMap<String, CanonicalClip>;

/// Closed label vocabulary built once per dataset.
///
/// Labels are the sorted distinct set over the final index; a label's index
/// is its sort rank, which makes the encoding independent of input file
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVocab {
    labels: Vec<String>,
}

impl LabelVocab {
    pub fn build(index: &CanonicalIndex) -> Self {
        let labels: Vec<String> = index
            .values()
            .flat_map(|clip| clip.labels.iter().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { labels }
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).ok()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
