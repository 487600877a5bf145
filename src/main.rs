use clap::Parser;
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clipindex::manifest::{write_manifests, ManifestConfig};
use clipindex::normalize::normalize_sources;
use clipindex::scheduler::run_extraction;
use clipindex::split::assign_splits;
use clipindex::types::Split;
use clipindex::verify::verify_outputs;
use clipindex::{Args, PipelineError, ToolExtractor};

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Pipeline failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), PipelineError> {
    let sources = args.annotation_sources()?;
    let split_files = args.split_sources()?;

    info!("Normalizing {} annotation source(s)...", sources.len());
    let (mut index, vocab, normalize_report) = normalize_sources(&sources);
    normalize_report.log_summary();
    if index.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "no clips survived normalization".to_string(),
        ));
    }

    let split_report = assign_splits(&mut index, &split_files)?;
    split_report.log_summary();

    info!("Scheduling extraction for {} clips...", index.len());
    let stop = Arc::new(AtomicBool::new(false));
    let extractor = ToolExtractor::new(args.tool_config(), Arc::clone(&stop));
    let scheduler_report = run_extraction(
        &index,
        args.mode,
        &extractor,
        &args.scheduler_config(),
        &args.out_dir,
        &args.ledger_path(),
        &stop,
    )?;
    scheduler_report.log_summary();

    let manifest_config = ManifestConfig {
        dataset: args.dataset.clone(),
        manifest_dir: args.manifest_dir.clone(),
        src_root: Some(args.src_dir.clone()),
        splits: vec![Split::Train, Split::Val, Split::Test, Split::Full],
        mode: args.mode,
    };
    let manifest_report = write_manifests(&index, &vocab, &scheduler_report.jobs, &manifest_config)?;
    manifest_report.log_summary();

    if args.verify {
        for &kind in args.mode.job_kinds() {
            let data_dir = match kind {
                clipindex::JobKind::VideoPassthrough => args.src_dir.clone(),
                _ => args.out_dir.clone(),
            };
            let report = verify_outputs(
                &scheduler_report.jobs,
                &args.manifest_dir,
                &data_dir,
                kind,
            )?;
            report.log_summary();
            if !report.is_clean() {
                warn!("{} outputs drifted from the manifests.", kind.as_str());
            }
        }
    }

    // Manifest write failures are fatal for their modality; surface them
    // after every modality has been attempted.
    if let Some(first) = manifest_report.errors.into_iter().next() {
        return Err(first);
    }
    info!("Pipeline completed successfully.");
    Ok(())
}
