//! The asynchronous job pipeline.
//!
//! Submissions become [`Job`]s in a [`ResultCache`](cache::ResultCache) and
//! are queued on a [`WorkerPool`](pool::WorkerPool). A worker runs each job's
//! documents through the batch loop in [`coordinator`], reporting progress into
//! the cache after every batch. Pollers only ever read the cache.

pub mod cache;
pub mod coordinator;
pub mod job;
pub mod page_processor;
pub mod pool;

pub use self::{
    cache::CacheError,
    coordinator::{
        CoordinatorOptions, JobCoordinator, Pipeline, PipelineOptions, ResultError, SubmitError,
    },
    job::{Job, JobId, JobResultReport, JobStatus, StatusReport},
};
