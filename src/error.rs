//! Error taxonomy for the pipeline.
//!
//! Only systemic problems surface as `Err`: split overlap, the extraction
//! abort threshold, manifest write failures. Per-record and per-job failures
//! are collected into the component reports so one malformed line never
//! aborts a whole run.

use thiserror::Error;

/// Fatal, run-level errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("split overlap: {clip_ids:?} assigned to more than one of train/val/test")]
    SplitOverlap { clip_ids: Vec<String> },

    #[error("extraction aborted: {failed} of {completed} completed jobs failed")]
    ExtractionAborted { failed: usize, completed: usize },

    #[error("failed to write {modality} manifest: {source}")]
    ManifestWrite {
        modality: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A raw record that could not be parsed against its declared schema
/// variant. Collected, never raised per-record.
#[derive(Debug, Clone, Error)]
#[error("{file} [{context}]: {message}")]
pub struct SchemaMismatch {
    /// Source file the record came from.
    pub file: String,
    /// Line number or JSON key identifying the record.
    pub context: String,
    pub message: String,
}

/// An irreconcilable merge collision between two sources describing the same
/// clip_id. The first record wins in the partial index; the conflict is
/// reported instead of silently resolved.
#[derive(Debug, Clone, Error)]
#[error("clip {clip_id}: conflicting {field} across annotation sources")]
pub struct DuplicateClipConflict {
    pub clip_id: String,
    /// The non-mergeable field that differed.
    pub field: String,
}

/// Why a single extraction attempt failed. Retried up to the configured
/// bound, then recorded on the job.
#[derive(Debug, Clone, Error)]
pub enum ExtractFailure {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("artifact count mismatch: expected at least {expected_min}, found {actual}")]
    ArtifactCountMismatch { expected_min: usize, actual: usize },
}
