//! The narrow interface to the external decode/flow tool.
//!
//! The scheduler never inspects codec internals; it hands a source path and
//! an output directory to a [`FrameExtractor`] and gets back an artifact
//! summary or a failure. The real implementation shells out to the
//! configured tool; tests substitute a fake.
//!
//! Success contract with the tool: zero exit status plus the artifact naming
//! convention `img_%05d`, `flow_x_%05d`, `flow_y_%05d` in the output
//! directory.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ToolConfig;
use crate::error::ExtractFailure;
use crate::ledger::JobKind;
use crate::types::CanonicalClip;

/// One extraction request, owned by the worker that runs it.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactSummary {
    pub artifact_count: usize,
}

pub trait FrameExtractor: Send + Sync {
    fn extract(&self, request: &ExtractRequest) -> Result<ArtifactSummary, ExtractFailure>;
}

/// Subprocess-backed extractor.
///
/// Each invocation is one isolated child process per clip; the worker blocks
/// on it, the scheduler does not. When the stop flag is raised the child is
/// given the configured grace period, then killed.
pub struct ToolExtractor {
    config: ToolConfig,
    stop: Arc<AtomicBool>,
}

impl ToolExtractor {
    pub fn new(config: ToolConfig, stop: Arc<AtomicBool>) -> Self {
        Self { config, stop }
    }

    fn run_tool(&self, request: &ExtractRequest) -> Result<(), ExtractFailure> {
        let mut command = Command::new(&self.config.program);
        command
            .arg(&request.source)
            .arg("--out-dir")
            .arg(&request.output_dir);
        if let Some(short_edge) = self.config.short_edge {
            command.arg("--short-edge").arg(short_edge.to_string());
        }
        if request.kind == JobKind::Flow {
            if let Some(algorithm) = &self.config.flow_algorithm {
                command.arg("--flow").arg(algorithm);
            }
        }

        let mut child = command
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExtractFailure::Decode(format!("failed to spawn {}: {e}", self.config.program))
            })?;

        let mut kill_deadline: Option<Instant> = None;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExtractFailure::Decode(format!("wait failed: {e}")));
                }
            }
            if self.stop.load(Relaxed) {
                let deadline =
                    *kill_deadline.get_or_insert_with(|| Instant::now() + self.config.grace_period);
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExtractFailure::Decode(
                        "terminated by stop signal".to_string(),
                    ));
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        };

        if status.success() {
            Ok(())
        } else {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            Err(ExtractFailure::Decode(format!(
                "{} exited with {}: {}",
                self.config.program,
                status,
                stderr.trim()
            )))
        }
    }
}

impl FrameExtractor for ToolExtractor {
    fn extract(&self, request: &ExtractRequest) -> Result<ArtifactSummary, ExtractFailure> {
        if request.kind == JobKind::VideoPassthrough {
            // Whole-video manifests only depend on the container file.
            return if request.source.exists() {
                Ok(ArtifactSummary { artifact_count: 0 })
            } else {
                Err(ExtractFailure::Decode(format!(
                    "container file missing: {}",
                    request.source.display()
                )))
            };
        }

        fs::create_dir_all(&request.output_dir)
            .map_err(|e| ExtractFailure::Decode(format!("failed to create output dir: {e}")))?;
        self.run_tool(request)?;
        let artifact_count = count_artifacts(&request.output_dir, request.kind)
            .map_err(|e| ExtractFailure::Decode(format!("failed to count artifacts: {e}")))?;
        Ok(ArtifactSummary { artifact_count })
    }
}

/// Count produced artifacts by the tool's naming convention.
///
/// Flow counts the x/y image pairs; an unpaired file counts as the smaller
/// side so a half-written pair never inflates the total.
pub fn count_artifacts(dir: &Path, kind: JobKind) -> std::io::Result<usize> {
    let mut frames = 0usize;
    let mut flow_x = 0usize;
    let mut flow_y = 0usize;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("img_") {
            frames += 1;
        } else if name.starts_with("flow_x_") {
            flow_x += 1;
        } else if name.starts_with("flow_y_") {
            flow_y += 1;
        }
    }

    Ok(match kind {
        JobKind::Frames => frames,
        JobKind::Flow => flow_x.min(flow_y),
        JobKind::VideoPassthrough => 0,
    })
}

/// The minimum artifact count a successful frames/flow job must reach,
/// derived from the clip's duration/fps hints when both are present.
///
/// Half the implied frame count: variable-fps containers legitimately decode
/// fewer frames than the nominal product, but an order-of-magnitude shortfall
/// means a broken decode.
pub fn expected_minimum(clip: &CanonicalClip) -> Option<usize> {
    let (duration, fps) = (clip.duration_hint?, clip.fps_hint?);
    if duration <= 0.0 || fps <= 0.0 {
        return None;
    }
    Some(((duration * fps * 0.5) as usize).max(1))
}
