//! Options shared by the `serve` and `extract` subcommands.
//!
//! Every option can also be set with an environment variable, and `main`
//! loads a `.env` file first, so deployments can be configured without flags.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    extract::BankDetailsExtractor,
    jobs::{CoordinatorOptions, JobCoordinator, Pipeline, PipelineOptions},
    ocr::{TesseractOptions, ocr_engine_for_name},
    pages::{FileDocumentOpener, RenderOptions},
    prelude::*,
    upload::UploadLimits,
};

/// Never sweep the cache less often than this.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How documents are split, recognized and judged.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// Pages rendered and processed together. Peak memory is about one batch
    /// of page images per running job.
    #[clap(long, env = "OCR_JOBS_BATCH_SIZE", default_value = "10")]
    pub batch_size: usize,

    /// Pages recognized concurrently within a batch.
    #[clap(long, env = "OCR_JOBS_PAGE_CONCURRENCY", default_value = "2")]
    pub page_concurrency: usize,

    /// Resolution used when rasterizing PDF pages.
    #[clap(long, env = "OCR_JOBS_DPI", default_value = "200")]
    pub dpi: u32,

    /// Fail a job if more than this fraction of its pages can't be
    /// recognized. Specified as a number between 0.0 and 1.0.
    #[clap(long, env = "OCR_JOBS_MAX_PAGE_FAILURE_RATE", default_value = "0.5")]
    pub max_page_failure_rate: f64,

    /// Fail a job if any of its documents has more pages than this.
    #[clap(long, env = "OCR_JOBS_MAX_PAGES")]
    pub max_pages: Option<usize>,

    /// OCR engine to use. Only "tesseract" is currently supported.
    #[clap(long, env = "OCR_JOBS_OCR_ENGINE", default_value = "tesseract")]
    pub ocr_engine: String,

    #[clap(flatten)]
    pub tesseract: TesseractOpts,
}

/// Tuning for the `tesseract` engine.
#[derive(Debug, Clone, Args)]
pub struct TesseractOpts {
    /// Tesseract language pack.
    #[clap(long, env = "OCR_JOBS_TESSERACT_LANGUAGE", default_value = "por")]
    pub tesseract_language: String,

    /// Tesseract page segmentation mode.
    #[clap(long, env = "OCR_JOBS_TESSERACT_PSM", default_value = "4")]
    pub tesseract_psm: u8,

    /// Tesseract OCR engine mode.
    #[clap(long, env = "OCR_JOBS_TESSERACT_OEM", default_value = "3")]
    pub tesseract_oem: u8,
}

/// Worker pool, result cache and upload limits.
#[derive(Debug, Clone, Args)]
pub struct JobOpts {
    /// Jobs that may run at once. Further jobs wait in a queue.
    #[clap(long, env = "OCR_JOBS_WORKERS", default_value = "2")]
    pub workers: usize,

    /// How long finished jobs stay available after their last update.
    #[clap(long, env = "OCR_JOBS_CACHE_TTL_SECS", default_value = "3600")]
    pub cache_ttl_secs: u64,

    /// Maximum number of finished jobs to keep. Active jobs are never evicted.
    #[clap(long, env = "OCR_JOBS_CACHE_CAPACITY", default_value = "100")]
    pub cache_capacity: usize,

    /// Maximum size of a single document, in bytes.
    #[clap(long, env = "OCR_JOBS_MAX_UPLOAD_BYTES", default_value = "104857600")]
    pub max_upload_bytes: u64,

    /// Where to stage uploads while their jobs run. Defaults to the system
    /// temporary directory.
    #[clap(long, env = "OCR_JOBS_UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,
}

impl PipelineOpts {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("--batch-size must be at least 1"));
        }
        if self.page_concurrency == 0 {
            return Err(anyhow!("--page-concurrency must be at least 1"));
        }
        if self.dpi == 0 {
            return Err(anyhow!("--dpi must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.max_page_failure_rate) {
            return Err(anyhow!(
                "--max-page-failure-rate must be between 0.0 and 1.0, got {}",
                self.max_page_failure_rate
            ));
        }
        Ok(())
    }

    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.batch_size,
            page_concurrency: self.page_concurrency,
            max_page_failure_rate: self.max_page_failure_rate,
            max_pages: self.max_pages,
        }
    }

    fn tesseract_options(&self) -> TesseractOptions {
        TesseractOptions {
            language: self.tesseract.tesseract_language.clone(),
            psm: self.tesseract.tesseract_psm,
            oem: self.tesseract.tesseract_oem,
        }
    }
}

impl JobOpts {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        if self.cache_ttl_secs == 0 {
            return Err(anyhow!("--cache-ttl-secs must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(anyhow!("--cache-capacity must be at least 1"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("--max-upload-bytes must be at least 1"));
        }
        Ok(())
    }

    /// Limits applied to each uploaded document.
    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_bytes: self.max_upload_bytes,
        }
    }

    fn coordinator_options(&self) -> CoordinatorOptions {
        let cache_ttl = Duration::from_secs(self.cache_ttl_secs);
        CoordinatorOptions {
            workers: self.workers,
            cache_ttl,
            cache_capacity: self.cache_capacity,
            sweep_interval: cache_ttl.min(MAX_SWEEP_INTERVAL),
        }
    }

    /// Create the staging directory, if one was configured.
    pub async fn prepare_upload_dir(&self) -> Result<()> {
        if let Some(dir) = &self.upload_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("cannot create upload directory {:?}", dir))?;
        }
        Ok(())
    }
}

/// Validate options and assemble a ready-to-use [`JobCoordinator`].
#[instrument(level = "debug", skip_all)]
pub fn build_coordinator(pipeline_opts: &PipelineOpts, job_opts: &JobOpts) -> Result<JobCoordinator> {
    pipeline_opts.validate()?;
    job_opts.validate()?;

    let engine = ocr_engine_for_name(&pipeline_opts.ocr_engine, &pipeline_opts.tesseract_options())?;
    let opener = Arc::new(FileDocumentOpener::new(RenderOptions {
        dpi: pipeline_opts.dpi,
    }));
    let pipeline = Pipeline::new(
        opener,
        engine,
        Arc::new(BankDetailsExtractor::new()),
        pipeline_opts.pipeline_options(),
    )?;
    let coordinator = JobCoordinator::new(pipeline, job_opts.coordinator_options())?;
    info!(
        workers = job_opts.workers,
        batch_size = pipeline_opts.batch_size,
        cache_ttl_secs = job_opts.cache_ttl_secs,
        "Job coordinator ready"
    );
    Ok(coordinator)
}
