//! Submitting jobs, running them on the worker pool, and answering polls.

use std::{sync::Arc, time::Duration};

use futures::{FutureExt as _, StreamExt as _};
use tokio::task::JoinHandle;

use super::{
    cache::{CacheError, ResultCache},
    job::{Job, JobError, JobId, JobResultReport, JobStatus, PageStats, StatusReport},
    page_processor::{BatchOutcome, PageProcessor},
    pool::{FaultFn, PoolStats, WorkFn, WorkerFault, WorkerPool},
};
use crate::{
    async_utils::{BoxedFuture, blocking::blocking_iter_stream},
    extract::{ExtractionRecord, RecordExtractor},
    ocr::OcrEngine,
    pages::{BatchPageSource, DocumentOpener},
    prelude::*,
    upload::{StagedDocument, ValidationError},
};

/// How documents are turned into records.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Pages rendered and processed together.
    pub batch_size: usize,
    /// Pages recognized concurrently within a batch.
    pub page_concurrency: usize,
    /// Fail the job if more than this fraction of its pages fail.
    pub max_page_failure_rate: f64,
    /// Fail the job if any document has more pages than this.
    pub max_pages: Option<usize>,
}

/// Settings for the pool and cache.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub workers: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub sweep_interval: Duration,
}

/// Submission failed, and no job was created.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("worker pool is not accepting jobs: {0:#}")]
    PoolClosed(anyhow::Error),
}

/// Why a result isn't available.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is not ready (status {status}, {progress}% complete)")]
    NotReady {
        id: JobId,
        status: JobStatus,
        progress: u8,
    },

    #[error("job {id} failed: {error}")]
    Failed { id: JobId, error: JobError },
}

/// How a job ended, if it ended on its own terms.
enum JobOutcome {
    Done {
        records: Vec<ExtractionRecord>,
        stats: PageStats,
        message: String,
    },
    Failed(JobError),
}

/// A job waiting in the pool's queue.
struct JobTicket {
    job_id: JobId,
    documents: Vec<StagedDocument>,
}

/// Runs one job's documents through the batch loop.
pub struct Pipeline {
    opener: Arc<dyn DocumentOpener>,
    processor: PageProcessor,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        opener: Arc<dyn DocumentOpener>,
        engine: Arc<dyn OcrEngine>,
        extractor: Arc<dyn RecordExtractor>,
        options: PipelineOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&options.max_page_failure_rate) {
            return Err(anyhow!(
                "page failure rate must be between 0 and 1, got {}",
                options.max_page_failure_rate
            ));
        }
        let processor = PageProcessor::new(engine, extractor, options.page_concurrency);
        Ok(Self {
            opener,
            processor,
            options,
        })
    }

    /// Run a job from `pending` to a terminal state.
    ///
    /// Document problems end the job in `error` here. Anything returned as
    /// `Err` is an internal fault, and the pool's fault handler records it.
    #[instrument(level = "info", name = "job", skip_all, fields(job_id = %ticket.job_id))]
    async fn run_job(&self, cache: &ResultCache, ticket: JobTicket) -> Result<()> {
        let JobTicket { job_id, documents } = ticket;
        cache.update(job_id, |job| job.start())??;
        info!(documents = documents.len(), "Job started");

        let outcome = self.execute(cache, job_id, &documents).await;
        // Dropping the staged documents deletes them.
        drop(documents);

        match outcome? {
            JobOutcome::Done {
                records,
                stats,
                message,
            } => {
                info!(records = records.len(), %message, "Job done");
                cache.update(job_id, |job| job.complete(records, stats, message))??;
            }
            JobOutcome::Failed(error) => {
                error!(%error, "Job failed");
                cache.update(job_id, |job| job.fail(error))??;
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        cache: &ResultCache,
        job_id: JobId,
        documents: &[StagedDocument],
    ) -> Result<JobOutcome> {
        // Open everything up front, so progress can be measured against the
        // batch count of the whole job.
        let mut sources = Vec::with_capacity(documents.len());
        for document in documents {
            let opened = match self.opener.open(document).await {
                Ok(opened) => opened,
                Err(err) => return Ok(JobOutcome::Failed(JobError::document_level(err.to_string()))),
            };
            let page_count = opened.page_count();
            match self.options.max_pages {
                Some(max_pages) if page_count > max_pages => {
                    return Ok(JobOutcome::Failed(JobError::document_level(format!(
                        "{:?} has {} pages, more than the limit of {}",
                        document.filename(),
                        page_count,
                        max_pages
                    ))));
                }
                _ => {}
            }
            let source = BatchPageSource::new(opened, self.options.batch_size)?;
            sources.push((document.filename().to_owned(), source));
        }

        let total_batches = sources.iter().map(|(_, s)| s.batch_count()).sum::<usize>();
        let mut stats = PageStats {
            total_pages: sources.iter().map(|(_, s)| s.page_count()).sum(),
            ..PageStats::default()
        };
        let mut records = vec![];
        let mut batches_done = 0;

        for (name, source) in &sources {
            let mut batches = blocking_iter_stream(source.batches());
            let mut batch_index = 0;
            while let Some(batch) = batches.next().await {
                let outcome = match batch {
                    Ok(batch) => self.processor.process_batch(name, batch).await,
                    Err(err) => {
                        let range = source.batch_range(batch_index);
                        warn!(document = %name, pages = ?range, "Could not render batch: {:#}", err);
                        BatchOutcome::render_failed(name, range, &err)
                    }
                };
                batch_index += 1;
                batches_done += 1;

                stats.processed_pages += outcome.pages;
                stats.relevant_pages += outcome.relevant_pages;
                stats.failed_pages += outcome.failures.len();
                records.extend(outcome.records);

                let progress = u8::try_from(batches_done * 100 / total_batches)
                    .context("progress out of range")?;
                cache.update(job_id, |job| job.record_progress(progress, stats))??;
                debug!(progress, processed_pages = stats.processed_pages, "Batch finished");
            }
        }

        Ok(self.decide(records, stats))
    }

    /// Apply the page-failure threshold and produce the final outcome.
    fn decide(&self, records: Vec<ExtractionRecord>, stats: PageStats) -> JobOutcome {
        let total = stats.total_pages;
        let failed = stats.failed_pages;
        let rate = self.options.max_page_failure_rate;
        if total > 0 && failed as f64 / total as f64 > rate {
            return JobOutcome::Failed(JobError::document_level(format!(
                "{} of {} pages could not be recognized, more than the allowed {:.0}%",
                failed,
                total,
                rate * 100.0
            )));
        }
        if failed > 0 && records.is_empty() {
            return JobOutcome::Failed(JobError::document_level(format!(
                "no records were extracted and {} page(s) could not be recognized",
                failed
            )));
        }

        let records = self.processor.extractor().finalize(records);
        let mut message = if records.is_empty() {
            "no records found".to_owned()
        } else {
            format!("{} record(s) found", records.len())
        };
        if failed > 0 {
            message.push_str(&format!("; {} page(s) skipped", failed));
        }
        JobOutcome::Done {
            records,
            stats,
            message,
        }
    }
}

/// Accepts submissions, runs them on the worker pool, and answers polls.
pub struct JobCoordinator {
    cache: Arc<ResultCache>,
    pool: WorkerPool<JobId, JobTicket>,
    sweeper: JoinHandle<()>,
}

impl JobCoordinator {
    /// Create a coordinator. Must be called inside a Tokio runtime.
    pub fn new(pipeline: Pipeline, options: CoordinatorOptions) -> Result<Self> {
        let cache = Arc::new(ResultCache::new(options.cache_ttl, options.cache_capacity));
        let pipeline = Arc::new(pipeline);

        let work_fn: WorkFn<JobTicket> = {
            let cache = cache.clone();
            Arc::new(move |ticket: JobTicket| -> BoxedFuture<Result<()>> {
                let cache = cache.clone();
                let pipeline = pipeline.clone();
                async move { pipeline.run_job(&cache, ticket).await }.boxed()
            })
        };
        let fault_fn: FaultFn<JobId> = {
            let cache = cache.clone();
            Arc::new(move |job_id: JobId, fault: WorkerFault| {
                record_fault(&cache, job_id, &fault)
            })
        };
        let pool = WorkerPool::new(options.workers, work_fn, fault_fn)?;
        let sweeper = cache.spawn_sweeper(options.sweep_interval);
        Ok(Self {
            cache,
            pool,
            sweeper,
        })
    }

    /// Create a pending job and queue it. Returns without waiting for any
    /// processing.
    pub fn submit(&self, documents: Vec<StagedDocument>) -> Result<JobId, SubmitError> {
        if documents.is_empty() {
            return Err(ValidationError::NoDocuments.into());
        }
        let job_id = JobId::new();
        let names = documents
            .iter()
            .map(|d| d.filename().to_owned())
            .collect::<Vec<_>>();
        self.cache.put(Job::new(job_id, names))?;
        if let Err(err) = self.pool.submit(job_id, JobTicket { job_id, documents }) {
            // Nobody will ever run it, so don't leave it pending.
            let _ = self.cache.update(job_id, |job| {
                job.fail(JobError::internal_fault("worker pool is shut down"))
            });
            return Err(SubmitError::PoolClosed(err));
        }
        info!(%job_id, "Job submitted");
        Ok(job_id)
    }

    /// Current status of a job.
    pub fn status(&self, job_id: JobId) -> Result<StatusReport, CacheError> {
        Ok(self.cache.get(job_id)?.status_report())
    }

    /// The result of a finished job.
    pub fn result(&self, job_id: JobId) -> Result<JobResultReport, ResultError> {
        let job = self
            .cache
            .get(job_id)
            .map_err(|_| ResultError::NotFound(job_id))?;
        if let Some(report) = job.result_report() {
            return Ok(report);
        }
        match job.error() {
            Some(error) => Err(ResultError::Failed {
                id: job_id,
                error: error.clone(),
            }),
            None => Err(ResultError::NotReady {
                id: job_id,
                status: job.status(),
                progress: job.progress(),
            }),
        }
    }

    /// Every live job, newest first.
    pub fn jobs(&self) -> Vec<StatusReport> {
        let mut jobs = self.cache.list();
        jobs.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        jobs.iter().map(Job::status_report).collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn cached_jobs(&self) -> usize {
        self.cache.len()
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.sweeper.abort();
        self.pool.close().await
    }
}

/// Mark a job whose task faulted as failed.
fn record_fault(cache: &ResultCache, job_id: JobId, fault: &WorkerFault) {
    let error = JobError::internal_fault(fault.to_string());
    match cache.update(job_id, |job| job.fail(error)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%job_id, "Fault after job finished: {}", err),
        Err(err) => error!(%job_id, "Could not record fault: {}", err),
    }
}
