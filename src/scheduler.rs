//! Extraction Scheduler: a bounded pool of workers that pull jobs from a
//! queue and delegate each clip to the external tool.
//!
//! Dispatch order is queue order (clip_id ascending) for reproducible
//! progress reporting; completion order is unconstrained, so everything
//! downstream re-sorts before emitting deterministic output. Each job is
//! owned by exactly one worker; the shared ledger writer only needs
//! append-safety.

use dashmap::DashMap;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::Mutex;
use std::thread;

use crate::config::{ExtractionMode, SchedulerConfig};
use crate::error::{ExtractFailure, PipelineError};
use crate::extract::{expected_minimum, ExtractRequest, FrameExtractor};
use crate::ledger::{load_ledger, ExtractionJob, JobKind, JobStatus, LedgerKey, LedgerWriter};
use crate::types::CanonicalIndex;

impl ExtractionMode {
    pub fn job_kinds(&self) -> &'static [JobKind] {
        match self {
            ExtractionMode::Frames => &[JobKind::Frames],
            ExtractionMode::Flow => &[JobKind::Flow],
            ExtractionMode::Both => &[JobKind::Frames, JobKind::Flow],
            ExtractionMode::Passthrough => &[JobKind::VideoPassthrough],
        }
    }
}

/// Terminal outcome of one scheduler run.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub total: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Terminal job state per (clip_id, kind), the manifest generator's
    /// second input besides the index itself.
    pub jobs: HashMap<LedgerKey, ExtractionJob>,
}

impl SchedulerReport {
    pub fn log_summary(&self) {
        info!(
            "Extraction: {} jobs total, {} done, {} skipped (prior runs), {} failed.",
            self.total, self.done, self.skipped, self.failed
        );
        if self.failed > 0 {
            warn!("{} jobs ended failed; their clips will be excluded from manifests.", self.failed);
        }
        let unprocessed = self.total - self.done - self.skipped - self.failed;
        if unprocessed > 0 {
            warn!("{unprocessed} jobs were not dispatched (stopped early); rerun to resume.");
        }
    }
}

struct QueuedJob {
    job: ExtractionJob,
    source: PathBuf,
    expected_min: Option<usize>,
}

/// Produce a terminal job for every clip requiring extraction.
///
/// Jobs already `done`/`skipped` in the persisted ledger are recorded
/// `skipped` without re-invoking the tool. Returns `ExtractionAborted` once
/// the failure rate across completed jobs crosses the configured threshold.
pub fn run_extraction(
    index: &CanonicalIndex,
    mode: ExtractionMode,
    extractor: &dyn FrameExtractor,
    config: &SchedulerConfig,
    out_root: &Path,
    ledger_path: &Path,
    stop: &AtomicBool,
) -> Result<SchedulerReport, PipelineError> {
    let prior = load_ledger(ledger_path)?;
    let writer = LedgerWriter::append(ledger_path)?;

    let results: DashMap<LedgerKey, ExtractionJob> = DashMap::new();
    let mut queue: VecDeque<QueuedJob> = VecDeque::new();
    let mut skipped = 0usize;

    // BTreeMap iteration gives clip_id ascending queue order.
    for (clip_id, clip) in index.iter() {
        for &kind in mode.job_kinds() {
            let output_path = match kind {
                JobKind::VideoPassthrough => clip.source_path.clone(),
                _ => out_root.join(kind.as_str()).join(clip_id),
            };
            let mut job = ExtractionJob::pending(clip_id.clone(), kind, output_path);

            if let Some(prev) = prior.get(&job.key()) {
                if prev.status.is_success() {
                    job.status = JobStatus::Skipped;
                    job.artifact_count = prev.artifact_count;
                    if let Err(e) = writer.record(&job) {
                        error!("Failed to persist ledger entry for {}: {e}", job.clip_id);
                    }
                    results.insert(job.key(), job);
                    skipped += 1;
                    continue;
                }
            }
            let expected_min = match kind {
                JobKind::VideoPassthrough => None,
                _ => expected_minimum(clip),
            };
            queue.push_back(QueuedJob {
                job,
                source: clip.source_path.clone(),
                expected_min,
            });
        }
    }

    let total = queue.len() + skipped;
    let pb = create_progress_bar(total as u64, "Extract");
    pb.inc(skipped as u64);

    let queue = Mutex::new(queue);
    let done = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let admitting = AtomicBool::new(true);

    thread::scope(|scope| {
        for _ in 0..config.workers.max(1) {
            scope.spawn(|| {
                run_worker(
                    &queue, extractor, config, stop, &admitting, &writer, &results, &done,
                    &failed, &pb,
                );
            });
        }
    });

    pb.finish_with_message("Extraction complete");

    let report = SchedulerReport {
        total,
        done: done.load(Relaxed),
        skipped,
        failed: failed.load(Relaxed),
        jobs: results.into_iter().collect(),
    };

    if !admitting.load(Relaxed) {
        return Err(PipelineError::ExtractionAborted {
            failed: report.failed,
            completed: report.done + report.failed,
        });
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    queue: &Mutex<VecDeque<QueuedJob>>,
    extractor: &dyn FrameExtractor,
    config: &SchedulerConfig,
    stop: &AtomicBool,
    admitting: &AtomicBool,
    writer: &LedgerWriter,
    results: &DashMap<LedgerKey, ExtractionJob>,
    done: &AtomicUsize,
    failed: &AtomicUsize,
    pb: &ProgressBar,
) {
    loop {
        // Stopped or aborted: leave queued jobs pending and unrecorded so a
        // future resume retries them.
        if stop.load(Relaxed) || !admitting.load(Relaxed) {
            break;
        }
        let Some(mut queued) = queue.lock().expect("job queue poisoned").pop_front() else {
            break;
        };

        queued.job.status = JobStatus::Running;
        let request = ExtractRequest {
            source: queued.source.clone(),
            output_dir: queued.job.output_path.clone(),
            kind: queued.job.kind,
        };

        let mut job = queued.job;
        let mut last_error = String::from("stopped before first attempt");
        while job.attempts < config.max_attempts {
            job.attempts += 1;
            match attempt(extractor, &request, queued.expected_min) {
                Ok(count) => {
                    job.status = JobStatus::Done;
                    job.artifact_count = count;
                    break;
                }
                Err(failure) => last_error = failure.to_string(),
            }
            if stop.load(Relaxed) {
                break;
            }
        }
        if job.status != JobStatus::Done {
            job.status = JobStatus::Failed;
            job.error = Some(last_error);
        }

        if let Err(e) = writer.record(&job) {
            error!("Failed to persist ledger entry for {}: {e}", job.clip_id);
        }
        let succeeded = job.status == JobStatus::Done;
        results.insert(job.key(), job);
        pb.inc(1);

        if succeeded {
            done.fetch_add(1, Relaxed);
        } else {
            let failed_now = failed.fetch_add(1, Relaxed) + 1;
            let completed = done.load(Relaxed) + failed_now;
            if completed >= config.abort_min_jobs
                && failed_now as f32 > completed as f32 * config.abort_failure_rate
                && admitting.swap(false, Relaxed)
            {
                warn!(
                    "Failure rate exceeded {:.0}% after {completed} jobs; \
                     no further jobs will be admitted.",
                    config.abort_failure_rate * 100.0
                );
            }
        }
    }
}

/// One invocation of the external tool, with the artifact-count floor
/// applied. A successful run below the floor is a failure, not a success.
fn attempt(
    extractor: &dyn FrameExtractor,
    request: &ExtractRequest,
    expected_min: Option<usize>,
) -> Result<Option<usize>, ExtractFailure> {
    let summary = extractor.extract(request)?;
    if request.kind == JobKind::VideoPassthrough {
        return Ok(None);
    }
    if let Some(min) = expected_min {
        if summary.artifact_count < min {
            return Err(ExtractFailure::ArtifactCountMismatch {
                expected_min: min,
                actual: summary.artifact_count,
            });
        }
    }
    Ok(Some(summary.artifact_count))
}

/// Create a progress bar with the given length and label
fn create_progress_bar(len: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{}] [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})",
                label
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ArtifactSummary;
    use crate::types::CanonicalClip;
    use std::collections::HashSet;

    struct FakeExtractor {
        invocations: AtomicUsize,
        failing: HashSet<String>,
        artifact_count: usize,
    }

    impl FakeExtractor {
        fn new(artifact_count: usize) -> Self {
            Self {
                invocations: AtomicUsize::new(0),
                failing: HashSet::new(),
                artifact_count,
            }
        }

        fn failing_on(mut self, clip_id: &str) -> Self {
            self.failing.insert(clip_id.to_string());
            self
        }

        fn invocations(&self) -> usize {
            self.invocations.load(Relaxed)
        }
    }

    impl FrameExtractor for FakeExtractor {
        fn extract(&self, request: &ExtractRequest) -> Result<ArtifactSummary, ExtractFailure> {
            self.invocations.fetch_add(1, Relaxed);
            let stem = request
                .source
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if self.failing.contains(stem) {
                return Err(ExtractFailure::Decode("synthetic failure".to_string()));
            }
            Ok(ArtifactSummary {
                artifact_count: self.artifact_count,
            })
        }
    }

    fn small_index(ids: &[&str]) -> CanonicalIndex {
        ids.iter()
            .map(|id| {
                let mut clip = CanonicalClip::new(*id, format!("videos/{id}.mp4"));
                clip.push_label("x");
                (id.to_string(), clip)
            })
            .collect()
    }

    fn run(
        index: &CanonicalIndex,
        mode: ExtractionMode,
        extractor: &dyn FrameExtractor,
        config: &SchedulerConfig,
        dir: &Path,
    ) -> Result<SchedulerReport, PipelineError> {
        run_extraction(
            index,
            mode,
            extractor,
            config,
            &dir.join("out"),
            &dir.join("ledger.jsonl"),
            &AtomicBool::new(false),
        )
    }

    #[test]
    fn all_jobs_complete_and_reach_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a", "b", "c"]);
        let fake = FakeExtractor::new(30);
        let config = SchedulerConfig::default();

        let report = run(&index, ExtractionMode::Frames, &fake, &config, dir.path()).unwrap();
        assert_eq!(report.done, 3);
        assert_eq!(report.failed, 0);

        let persisted = load_ledger(&dir.path().join("ledger.jsonl")).unwrap();
        assert_eq!(persisted.len(), 3);
        let job = &persisted[&("a".to_string(), JobKind::Frames)];
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.artifact_count, Some(30));
    }

    #[test]
    fn resume_skips_prior_done_jobs_without_reinvoking() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a", "b"]);
        let config = SchedulerConfig::default();

        let first = FakeExtractor::new(30);
        run(&index, ExtractionMode::Frames, &first, &config, dir.path()).unwrap();
        assert_eq!(first.invocations(), 2);

        let second = FakeExtractor::new(30);
        let report = run(&index, ExtractionMode::Frames, &second, &config, dir.path()).unwrap();
        assert_eq!(second.invocations(), 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.done, 0);

        // Skipped jobs still carry the prior artifact counts for manifests.
        let job = &report.jobs[&("a".to_string(), JobKind::Frames)];
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.artifact_count, Some(30));
    }

    #[test]
    fn failed_jobs_retry_to_the_bound_then_stay_failed() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["bad", "good"]);
        let fake = FakeExtractor::new(30).failing_on("bad");
        let config = SchedulerConfig {
            abort_min_jobs: 100,
            ..SchedulerConfig::default()
        };

        let report = run(&index, ExtractionMode::Frames, &fake, &config, dir.path()).unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(report.failed, 1);

        let job = &report.jobs[&("bad".to_string(), JobKind::Frames)];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.as_deref().unwrap().contains("synthetic failure"));
    }

    #[test]
    fn undercount_downgrades_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = small_index(&["short"]);
        let clip = index.get_mut("short").unwrap();
        clip.duration_hint = Some(10.0);
        clip.fps_hint = Some(30.0);

        // 5 artifacts against an expected minimum of 150.
        let fake = FakeExtractor::new(5);
        let config = SchedulerConfig {
            abort_min_jobs: 100,
            ..SchedulerConfig::default()
        };
        let report = run(&index, ExtractionMode::Frames, &fake, &config, dir.path()).unwrap();

        let job = &report.jobs[&("short".to_string(), JobKind::Frames)];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("artifact count mismatch"));
    }

    #[test]
    fn failure_rate_threshold_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a", "b", "c", "d"]);
        let fake = FakeExtractor::new(30)
            .failing_on("a")
            .failing_on("b")
            .failing_on("c")
            .failing_on("d");
        let config = SchedulerConfig {
            workers: 1,
            abort_min_jobs: 2,
            abort_failure_rate: 0.5,
            ..SchedulerConfig::default()
        };

        let err = run(&index, ExtractionMode::Frames, &fake, &config, dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionAborted { .. }));
    }

    #[test]
    fn stop_signal_prevents_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a", "b"]);
        let fake = FakeExtractor::new(30);
        let stop = AtomicBool::new(true);

        let report = run_extraction(
            &index,
            ExtractionMode::Frames,
            &fake,
            &SchedulerConfig::default(),
            &dir.path().join("out"),
            &dir.path().join("ledger.jsonl"),
            &stop,
        )
        .unwrap();

        assert_eq!(fake.invocations(), 0);
        assert_eq!(report.done + report.failed, 0);
        // Nothing recorded: a future resume retries everything.
        assert!(load_ledger(&dir.path().join("ledger.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn both_mode_schedules_frames_and_flow_per_clip() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a"]);
        let fake = FakeExtractor::new(30);

        let report = run(
            &index,
            ExtractionMode::Both,
            &fake,
            &SchedulerConfig::default(),
            dir.path(),
        )
        .unwrap();
        assert_eq!(report.total, 2);
        assert!(report.jobs.contains_key(&("a".to_string(), JobKind::Frames)));
        assert!(report.jobs.contains_key(&("a".to_string(), JobKind::Flow)));
    }

    #[test]
    fn passthrough_jobs_record_no_artifact_count() {
        let dir = tempfile::tempdir().unwrap();
        let index = small_index(&["a"]);
        let fake = FakeExtractor::new(30);

        let report = run(
            &index,
            ExtractionMode::Passthrough,
            &fake,
            &SchedulerConfig::default(),
            dir.path(),
        )
        .unwrap();
        let job = &report.jobs[&("a".to_string(), JobKind::VideoPassthrough)];
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.artifact_count, None);
    }
}
