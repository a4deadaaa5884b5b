//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc};

use clap::Args;

use crate::{
    config::{JobOpts, PipelineOpts, build_coordinator},
    prelude::*,
    server::{self, AppState},
};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, env = "OCR_JOBS_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,

    #[clap(flatten)]
    pub jobs: JobOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    opts.jobs.prepare_upload_dir().await?;
    let coordinator = Arc::new(build_coordinator(&opts.pipeline, &opts.jobs)?);
    let state = AppState {
        coordinator: coordinator.clone(),
        limits: opts.jobs.upload_limits(),
        upload_dir: opts.jobs.upload_dir.clone(),
    };
    server::serve(opts.listen, state).await?;

    // Jobs can't be cancelled, so let the ones we've accepted finish.
    match Arc::try_unwrap(coordinator) {
        Ok(coordinator) => {
            info!("Waiting for queued jobs to finish");
            coordinator.shutdown().await
        }
        Err(_) => {
            warn!("Coordinator still in use, not waiting for queued jobs");
            Ok(())
        }
    }
}
