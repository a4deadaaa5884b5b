//! The `extract` subcommand: run local files through the job pipeline.

use std::{collections::BTreeMap, time::Duration};

use clap::Args;
use futures::{StreamExt as _, stream};
use indicatif::ProgressBar;
use schemars::JsonSchema;

use crate::{
    async_utils::io::write_jsonl,
    config::{JobOpts, PipelineOpts, build_coordinator},
    jobs::{JobCoordinator, JobId, JobResultReport, JobStatus, job::JobError},
    prelude::*,
    ui::{ProgressConfig, Ui},
    upload::{StagedDocument, stage_file},
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// Documents to process (PDF, TIFF, PNG or JPEG).
    #[clap(required = true, value_name = "FILE")]
    pub inputs: Vec<PathBuf>,

    /// Process all inputs as a single job, instead of one job per file.
    #[clap(long)]
    pub single_job: bool,

    /// Output location, as JSONL. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// How often to poll job status, in milliseconds.
    #[clap(long, default_value = "250")]
    pub poll_interval_ms: u64,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,

    #[clap(flatten)]
    pub jobs: JobOpts,
}

/// One output line per job.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ExtractOutput {
    pub job_id: JobId,
    pub status: JobStatus,
    pub documents: Vec<String>,
    /// Present when `status` is `done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultReport>,
    /// Present when `status` is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    opts.jobs.prepare_upload_dir().await?;
    let coordinator = build_coordinator(&opts.pipeline, &opts.jobs)?;

    // Validate everything before submitting anything.
    let limits = opts.jobs.upload_limits();
    let mut staged = Vec::with_capacity(opts.inputs.len());
    for input in &opts.inputs {
        let document = stage_file(input, &limits, opts.jobs.upload_dir.as_deref())
            .await
            .with_context(|| format!("cannot admit {:?}", input.display()))?;
        staged.push(document);
    }

    let groups: Vec<Vec<StagedDocument>> = if opts.single_job {
        vec![staged]
    } else {
        staged.into_iter().map(|document| vec![document]).collect()
    };
    let mut job_ids = Vec::with_capacity(groups.len());
    for group in groups {
        job_ids.push(coordinator.submit(group)?);
    }

    let poll_interval = Duration::from_millis(opts.poll_interval_ms.max(1));
    let outputs = wait_for_jobs(&ui, &coordinator, &job_ids, poll_interval).await?;
    coordinator.shutdown().await?;

    let failed = outputs
        .iter()
        .filter(|output| output.status == JobStatus::Error)
        .count();
    let total = outputs.len();
    let output_stream = stream::iter(outputs.into_iter().map(Ok)).boxed();
    write_jsonl(opts.output_path.as_deref(), output_stream).await?;

    if failed > 0 {
        Err(anyhow!("{} of {} jobs failed", failed, total))
    } else {
        ui.display_message("✅", &format!("{} job(s) finished", total));
        Ok(())
    }
}

/// Poll until every job is terminal, showing one progress bar per job.
async fn wait_for_jobs(
    ui: &Ui,
    coordinator: &JobCoordinator,
    job_ids: &[JobId],
    poll_interval: Duration,
) -> Result<Vec<ExtractOutput>> {
    let mut bars: BTreeMap<usize, ProgressBar> = BTreeMap::new();
    for (idx, job_id) in job_ids.iter().enumerate() {
        let report = coordinator.status(*job_id)?;
        let msg = report.documents.join(", ");
        let pb = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: &msg,
                done_msg: &msg,
            },
            100,
        );
        bars.insert(idx, pb);
    }

    let mut outputs: Vec<Option<ExtractOutput>> = vec![None; job_ids.len()];
    while outputs.iter().any(Option::is_none) {
        for (idx, job_id) in job_ids.iter().enumerate() {
            if outputs[idx].is_some() {
                continue;
            }
            let report = coordinator.status(*job_id)?;
            if let Some(pb) = bars.get(&idx) {
                pb.set_position(u64::from(report.progress));
            }
            if report.status.is_terminal() {
                if let Some(pb) = bars.remove(&idx) {
                    pb.finish_with_message(report.message.clone());
                }
                outputs[idx] = Some(ExtractOutput {
                    job_id: *job_id,
                    status: report.status,
                    documents: report.documents,
                    result: coordinator.result(*job_id).ok(),
                    error: report.error,
                });
            }
        }
        if outputs.iter().any(Option::is_none) {
            tokio::time::sleep(poll_interval).await;
        }
    }
    Ok(outputs.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        jobs::{CoordinatorOptions, Pipeline, PipelineOptions},
        testing::{FakeDocument, FakeOpener, ScriptedOcrEngine, TaggedLineExtractor, staged},
    };

    #[tokio::test]
    async fn waits_for_every_job_and_reports_failures() -> Result<()> {
        let opener = FakeOpener::new().with_document("good.pdf", FakeDocument::new(12));
        let pipeline = Pipeline::new(
            Arc::new(opener),
            Arc::new(ScriptedOcrEngine::new()),
            Arc::new(TaggedLineExtractor),
            PipelineOptions {
                batch_size: 5,
                page_concurrency: 2,
                max_page_failure_rate: 0.5,
                max_pages: None,
            },
        )?;
        let coordinator = JobCoordinator::new(
            pipeline,
            CoordinatorOptions {
                workers: 2,
                cache_ttl: Duration::from_secs(60),
                cache_capacity: 10,
                sweep_interval: Duration::from_secs(60),
            },
        )?;
        let dir = tempfile::TempDir::new()?;
        let good = coordinator.submit(vec![staged(dir.path(), "good.pdf")])?;
        let bad = coordinator.submit(vec![staged(dir.path(), "bad.pdf")])?;

        let ui = Ui::init_for_tests();
        let outputs =
            wait_for_jobs(&ui, &coordinator, &[good, bad], Duration::from_millis(2)).await?;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].job_id, good);
        assert_eq!(outputs[0].status, JobStatus::Done);
        assert_eq!(outputs[0].result.as_ref().map(|r| r.records_found), Some(12));
        assert_eq!(outputs[1].status, JobStatus::Error);
        assert!(outputs[1].error.is_some());
        assert!(outputs[1].result.is_none());
        coordinator.shutdown().await
    }
}
