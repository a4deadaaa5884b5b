//! Limits on how many CPU-hungry external processes run at once.
//!
//! The worker pool bounds how many jobs run in parallel, but each job may OCR
//! several pages concurrently. Without a global cap, `workers *
//! page_concurrency` copies of `tesseract` could compete for the same cores.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per logical CPU, shared by every job in the process.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Use this around external processes that will each try to use a full core.
/// In-process rendering runs on Tokio's blocking pool and doesn't need it.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    f().await
}
