use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PipelineError;
use crate::normalize::{AnnotationSchema, AnnotationSource};
use crate::split::SplitFile;
use crate::types::Split;

/// Command-line arguments for building a clip index and its extraction
/// outputs.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Args {
    /// Dataset name, used as the manifest file prefix
    #[arg(short = 'n', long = "dataset")]
    pub dataset: String,

    /// Annotation sources, each as <schema>:<path> where <schema> is one of
    /// single_label, multi_label, segments, class_folders@<split>
    #[arg(long = "annotations", required = true)]
    pub annotations: Vec<String>,

    /// Split index files, each as <split>:<path>
    #[arg(long = "split_file")]
    pub split_files: Vec<String>,

    /// Column delimiter for single-label list files
    #[arg(long = "delimiter", default_value = ",")]
    pub delimiter: char,

    /// Directory containing the source media
    #[arg(long = "src_dir")]
    pub src_dir: PathBuf,

    /// Root directory for extracted frame and flow artifacts
    #[arg(long = "out_dir")]
    pub out_dir: PathBuf,

    /// Directory the manifests are written to
    #[arg(long = "manifest_dir")]
    pub manifest_dir: PathBuf,

    /// What to extract for each clip
    #[arg(long = "mode", value_enum, default_value = "frames")]
    pub mode: ExtractionMode,

    /// External decode/flow tool invoked per clip
    #[arg(long = "tool", default_value = "denseflow")]
    pub tool: String,

    /// Number of extraction workers
    #[arg(long = "workers", default_value_t = 4, value_parser = validate_workers)]
    pub workers: usize,

    /// Target short edge passed to the tool, in pixels
    #[arg(long = "short_edge")]
    pub short_edge: Option<u32>,

    /// Optical flow algorithm passed to the tool
    #[arg(long = "flow_algorithm", default_value = "tvl1")]
    pub flow_algorithm: String,

    /// Retry bound per extraction job
    #[arg(long = "max_attempts", default_value_t = 3)]
    pub max_attempts: u32,

    /// Stop admitting jobs once this fraction of completed jobs has failed
    #[arg(long = "abort_failure_rate", default_value_t = 0.5, value_parser = validate_rate)]
    pub abort_failure_rate: f32,

    /// Job ledger path; defaults to <out_dir>/ledger.jsonl
    #[arg(long = "ledger")]
    pub ledger: Option<PathBuf>,

    /// Verify outputs against ledger and manifests after generation
    #[arg(long = "verify")]
    pub verify: bool,
}

impl Args {
    /// Parse the `<schema>:<path>` annotation source specs.
    pub fn annotation_sources(&self) -> Result<Vec<AnnotationSource>, PipelineError> {
        self.annotations
            .iter()
            .map(|spec| {
                let (kind, path) = spec.split_once(':').ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "annotation spec '{spec}' is not <schema>:<path>"
                    ))
                })?;
                let schema = match kind {
                    "single_label" => AnnotationSchema::SingleLabelList {
                        delimiter: self.delimiter,
                    },
                    "multi_label" => AnnotationSchema::MultiLabelList,
                    "segments" => AnnotationSchema::TemporalSegmentJson,
                    other => match other.split_once('@') {
                        Some(("class_folders", split)) => {
                            let split = Split::parse(split).ok_or_else(|| {
                                PipelineError::InvalidConfig(format!(
                                    "unknown split '{split}' in annotation spec '{spec}'"
                                ))
                            })?;
                            AnnotationSchema::SplitIndexClassFolders { split }
                        }
                        _ => {
                            return Err(PipelineError::InvalidConfig(format!(
                                "unknown annotation schema '{other}'"
                            )))
                        }
                    },
                };
                Ok(AnnotationSource {
                    path: PathBuf::from(path),
                    schema,
                })
            })
            .collect()
    }

    /// Parse the `<split>:<path>` split file specs.
    pub fn split_sources(&self) -> Result<Vec<SplitFile>, PipelineError> {
        self.split_files
            .iter()
            .map(|spec| {
                let (split, path) = spec.split_once(':').ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "split file spec '{spec}' is not <split>:<path>"
                    ))
                })?;
                let split = Split::parse(split).ok_or_else(|| {
                    PipelineError::InvalidConfig(format!("unknown split '{split}'"))
                })?;
                Ok(SplitFile {
                    path: PathBuf::from(path),
                    split,
                })
            })
            .collect()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .clone()
            .unwrap_or_else(|| self.out_dir.join("ledger.jsonl"))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            max_attempts: self.max_attempts,
            abort_failure_rate: self.abort_failure_rate,
            ..SchedulerConfig::default()
        }
    }

    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            program: self.tool.clone(),
            short_edge: self.short_edge,
            flow_algorithm: Some(self.flow_algorithm.clone()),
            ..ToolConfig::default()
        }
    }
}

/// What the scheduler produces for each clip.
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum ExtractionMode {
    /// Decoded RGB frames
    Frames,
    /// Optical flow x/y images
    Flow,
    /// Frames and flow
    Both,
    /// Whole-video manifests only, no decoding
    Passthrough,
}

/// Scheduler tuning, passed in by the driving caller.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub max_attempts: u32,
    /// Fraction of completed (done + failed) jobs that may fail before the
    /// scheduler stops admitting new jobs.
    pub abort_failure_rate: f32,
    /// Minimum completed jobs before the abort threshold is evaluated.
    pub abort_min_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            abort_failure_rate: 0.5,
            abort_min_jobs: 20,
        }
    }
}

/// External tool invocation parameters.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub program: String,
    pub short_edge: Option<u32>,
    pub flow_algorithm: Option<String>,
    /// How long a running subprocess may keep going after a stop signal
    /// before it is force-terminated.
    pub grace_period: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "denseflow".to_string(),
            short_edge: None,
            flow_algorithm: None,
            grace_period: Duration::from_secs(30),
        }
    }
}

// Validate that the worker count is at least one
fn validate_workers(s: &str) -> Result<usize, String> {
    match usize::from_str(s) {
        Ok(val) if val >= 1 => Ok(val),
        _ => Err("WORKERS must be a positive integer".to_string()),
    }
}

// Validate that the rate is between 0.0 and 1.0
fn validate_rate(s: &str) -> Result<f32, String> {
    match f32::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("RATE must be between 0.0 and 1.0".to_string()),
    }
}
