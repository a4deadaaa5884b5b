//! Jobs and their lifecycle.
//!
//! A job goes `pending → processing → done | error`, and never leaves a
//! terminal state. All of the rules live in the transition methods on [`Job`],
//! so the fields are private and nobody can skip them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{extract::ExtractionRecord, prelude::*};

/// Opaque, never-reused job identifier.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Pending,
    /// A worker is running it.
    Processing,
    /// Finished, and `result` is available.
    Done,
    /// Failed, and `error` says why.
    Error,
}

impl JobStatus {
    /// `done` or `error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// `pending` or `processing`. Active jobs are still owned by a worker.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What kind of failure ended a job.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// A document was unreadable, too long, or too many pages failed.
    DocumentLevel,
    /// Something went wrong in our own code.
    InternalFault,
}

/// Why a job ended in `error`.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn document_level(detail: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::DocumentLevel,
            detail: detail.into(),
        }
    }

    pub fn internal_fault(detail: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::InternalFault,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            JobErrorKind::DocumentLevel => write!(f, "document error: {}", self.detail),
            JobErrorKind::InternalFault => write!(f, "internal error: {}", self.detail),
        }
    }
}

/// Page counts for a job.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct PageStats {
    /// Pages in all of the job's documents.
    pub total_pages: usize,
    /// Pages we've finished with, successfully or not.
    pub processed_pages: usize,
    /// Pages the extractor considered relevant.
    pub relevant_pages: usize,
    /// Pages that could not be rendered or recognized.
    pub failed_pages: usize,
}

/// An attempt to make a transition the lifecycle doesn't allow.
#[derive(Debug, thiserror::Error)]
#[error("cannot {action} a job that is {status}")]
pub struct TransitionError {
    pub action: &'static str,
    pub status: JobStatus,
}

/// One submitted set of documents and everything we know about it.
#[derive(Clone, Debug)]
pub struct Job {
    id: JobId,
    status: JobStatus,
    progress: u8,
    message: String,
    documents: Vec<String>,
    stats: PageStats,
    result: Option<Vec<ExtractionRecord>>,
    error: Option<JobError>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    /// Every progress value written, in order.
    #[cfg(test)]
    progress_history: Vec<u8>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(id: JobId, documents: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            progress: 0,
            message: "waiting for a worker".to_owned(),
            documents,
            stats: PageStats::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            #[cfg(test)]
            progress_history: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    #[cfg(test)]
    pub fn progress_history(&self) -> &[u8] {
        &self.progress_history
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stats(&self) -> PageStats {
        self.stats
    }

    /// Records, only once the job is `done`.
    pub fn result(&self) -> Option<&[ExtractionRecord]> {
        self.result.as_deref()
    }

    /// Failure details, only once the job is `error`.
    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `pending → processing`. Allowed exactly once.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            return Err(self.transition_error("start"));
        }
        self.status = JobStatus::Processing;
        self.message = "processing".to_owned();
        self.started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Record progress while processing.
    ///
    /// Progress never goes backwards; a lower value keeps the old one. Returns
    /// `Ok(false)` without changing anything if the job is already terminal,
    /// since a late report must not disturb a finished job.
    pub fn record_progress(
        &mut self,
        progress: u8,
        stats: PageStats,
    ) -> Result<bool, TransitionError> {
        match self.status {
            JobStatus::Processing => {}
            JobStatus::Done | JobStatus::Error => return Ok(false),
            JobStatus::Pending => return Err(self.transition_error("report progress for")),
        }
        // 100 is reserved for `done`.
        self.progress = self.progress.max(progress.min(99));
        #[cfg(test)]
        self.progress_history.push(self.progress);
        self.stats = stats;
        self.message = format!(
            "processing page {}/{}",
            stats.processed_pages, stats.total_pages
        );
        self.touch();
        Ok(true)
    }

    /// `processing → done`, publishing the result in the same step.
    pub fn complete(
        &mut self,
        records: Vec<ExtractionRecord>,
        stats: PageStats,
        message: String,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.transition_error("complete"));
        }
        self.status = JobStatus::Done;
        self.progress = 100;
        #[cfg(test)]
        self.progress_history.push(self.progress);
        self.stats = stats;
        self.result = Some(records);
        self.message = message;
        self.finish();
        Ok(())
    }

    /// `pending | processing → error`.
    ///
    /// Failing a pending job is allowed, because a worker can fault before it
    /// ever gets to call [`Job::start`].
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error("fail"));
        }
        self.status = JobStatus::Error;
        self.message = error.to_string();
        self.error = Some(error);
        self.finish();
        Ok(())
    }

    /// Seconds between `start` and the terminal transition.
    pub fn processing_time_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds() as f64 / 1000.0)
    }

    /// A snapshot for status polling.
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            job_id: self.id,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            documents: self.documents.clone(),
            stats: self.stats,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// The full result, if the job is `done`.
    pub fn result_report(&self) -> Option<JobResultReport> {
        let items = self.result.clone()?;
        Some(JobResultReport {
            job_id: self.id,
            documents: self.documents.clone(),
            total_pages: self.stats.total_pages,
            relevant_pages: self.stats.relevant_pages,
            failed_pages: self.stats.failed_pages,
            records_found: items.len(),
            items,
            message: self.message.clone(),
            processing_time_seconds: self.processing_time_secs(),
        })
    }

    fn transition_error(&self, action: &'static str) -> TransitionError {
        TransitionError {
            action,
            status: self.status,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        self.touch();
        self.completed_at = Some(self.updated_at);
    }
}

/// What a poller sees.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    /// 0 to 100. Never decreases, and is 100 exactly when `status` is `done`.
    pub progress: u8,
    pub message: String,
    /// File names, in processing order.
    pub documents: Vec<String>,
    #[serde(flatten)]
    pub stats: PageStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The records from a finished job.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct JobResultReport {
    pub job_id: JobId,
    pub documents: Vec<String>,
    pub total_pages: usize,
    pub relevant_pages: usize,
    pub failed_pages: usize,
    pub records_found: usize,
    pub items: Vec<ExtractionRecord>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
}
