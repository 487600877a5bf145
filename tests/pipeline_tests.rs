//! End-to-end pipeline tests: normalize → partition → extract (fake tool)
//! → manifests, exercising idempotence and resume behavior.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};

use clipindex::error::ExtractFailure;
use clipindex::extract::{ArtifactSummary, ExtractRequest, FrameExtractor};
use clipindex::manifest::{write_manifests, ManifestConfig};
use clipindex::normalize::{normalize_sources, AnnotationSchema, AnnotationSource};
use clipindex::scheduler::run_extraction;
use clipindex::split::{assign_splits, SplitFile};
use clipindex::types::{CanonicalIndex, LabelVocab, Split};
use clipindex::{ExtractionMode, SchedulerConfig};

struct FakeExtractor {
    invocations: AtomicUsize,
    artifact_count: usize,
}

impl FakeExtractor {
    fn new(artifact_count: usize) -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            artifact_count,
        }
    }
}

impl FrameExtractor for FakeExtractor {
    fn extract(&self, _request: &ExtractRequest) -> Result<ArtifactSummary, ExtractFailure> {
        self.invocations.fetch_add(1, Relaxed);
        Ok(ArtifactSummary {
            artifact_count: self.artifact_count,
        })
    }
}

/// Two annotation sources sharing clip abc123 (labels union to run+jump),
/// plus one clip that no split file mentions.
fn write_fixture(dir: &Path) -> (Vec<AnnotationSource>, Vec<SplitFile>) {
    let csv = dir.join("list.csv");
    fs::write(
        &csv,
        "clips/abc123.mp4,run\nclips/def456.mp4,walk\nclips/xyz.mp4,walk\n",
    )
    .unwrap();

    let json = dir.join("extra.json");
    fs::write(
        &json,
        r#"{"abc123": {"path": "clips/abc123.mp4", "labels": ["jump"]}}"#,
    )
    .unwrap();

    let train = dir.join("train.txt");
    fs::write(&train, "abc123\n").unwrap();
    let val = dir.join("val.txt");
    fs::write(&val, "def456\n").unwrap();

    (
        vec![
            AnnotationSource {
                path: csv,
                schema: AnnotationSchema::SingleLabelList { delimiter: ',' },
            },
            AnnotationSource {
                path: json,
                schema: AnnotationSchema::MultiLabelList,
            },
        ],
        vec![
            SplitFile {
                path: train,
                split: Split::Train,
            },
            SplitFile {
                path: val,
                split: Split::Val,
            },
        ],
    )
}

fn build_index(dir: &Path) -> (CanonicalIndex, LabelVocab) {
    let (sources, split_files) = write_fixture(dir);
    let (mut index, vocab, report) = normalize_sources(&sources);
    assert!(report.schema_errors.is_empty());
    assert!(report.merge_conflicts.is_empty());
    let split_report = assign_splits(&mut index, &split_files).unwrap();
    assert_eq!(split_report.unassigned, vec!["xyz"]);
    (index, vocab)
}

fn run_pipeline(
    fixture_dir: &Path,
    work_dir: &Path,
    extractor: &FakeExtractor,
) -> HashMap<PathBuf, Vec<u8>> {
    let (index, vocab) = build_index(fixture_dir);

    let report = run_extraction(
        &index,
        ExtractionMode::Frames,
        extractor,
        &SchedulerConfig::default(),
        &work_dir.join("out"),
        &work_dir.join("ledger.jsonl"),
        &AtomicBool::new(false),
    )
    .unwrap();

    let manifest_dir = work_dir.join("manifests");
    let manifest_report = write_manifests(
        &index,
        &vocab,
        &report.jobs,
        &ManifestConfig {
            dataset: "demo".to_string(),
            manifest_dir: manifest_dir.clone(),
            src_root: None,
            splits: vec![Split::Train, Split::Val, Split::Full],
            mode: ExtractionMode::Frames,
        },
    )
    .unwrap();
    assert!(manifest_report.errors.is_empty());

    let mut files = HashMap::new();
    for path in manifest_report.written {
        let content = fs::read(&path).unwrap();
        files.insert(path.strip_prefix(&manifest_dir).unwrap().to_path_buf(), content);
    }
    files
}

#[test]
fn merged_labels_encode_by_vocabulary_rank() {
    let tmp = tempfile::tempdir().unwrap();
    let fake = FakeExtractor::new(30);
    let files = run_pipeline(tmp.path(), &tmp.path().join("run"), &fake);

    let train = String::from_utf8(files[&PathBuf::from("demo_train_frames.txt")].clone()).unwrap();
    // Vocabulary is {jump: 0, run: 1, walk: 2}; abc123 carries run+jump.
    assert_eq!(train, "abc123 30 0,1\n");

    let val = String::from_utf8(files[&PathBuf::from("demo_val_frames.txt")].clone()).unwrap();
    assert_eq!(val, "def456 30 2\n");

    // The unassigned clip appears nowhere.
    for content in files.values() {
        assert!(!String::from_utf8_lossy(content).contains("xyz"));
    }
}

#[test]
fn pipeline_is_idempotent_on_unchanged_inputs() {
    let tmp = tempfile::tempdir().unwrap();
    let first = run_pipeline(tmp.path(), &tmp.path().join("a"), &FakeExtractor::new(30));
    let second = run_pipeline(tmp.path(), &tmp.path().join("b"), &FakeExtractor::new(30));
    assert_eq!(first, second);
}

#[test]
fn resume_regenerates_manifests_without_reinvoking_the_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let work_dir = tmp.path().join("work");

    let first = FakeExtractor::new(30);
    let first_files = run_pipeline(tmp.path(), &work_dir, &first);
    // Three clips in the index, one frames job each (the unassigned clip is
    // still extracted; it is only manifests that exclude it).
    assert_eq!(first.invocations.load(Relaxed), 3);

    // Same ledger: every job resolves as skipped, manifests come out
    // byte-identical.
    let second = FakeExtractor::new(99);
    let second_files = run_pipeline(tmp.path(), &work_dir, &second);
    assert_eq!(second.invocations.load(Relaxed), 0);
    assert_eq!(first_files, second_files);
}
