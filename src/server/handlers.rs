//! Route handlers.

use axum::{
    Json,
    extract::{Multipart, Path as UrlPath, State},
    http::StatusCode,
};

use super::{ApiError, AppState};
use crate::{
    jobs::{JobId, JobResultReport, JobStatus, StatusReport},
    prelude::*,
    upload::{UploadSink, ValidationError},
};

/// Most documents we'll take in a single upload.
const MAX_FILES_PER_UPLOAD: usize = 20;

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub workers: usize,
    pub queued: usize,
    pub running: usize,
    pub cached_jobs: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UploadResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let stats = state.coordinator.pool_stats();
    Json(HealthReport {
        status: "ok".to_owned(),
        workers: stats.capacity,
        queued: stats.queued,
        running: stats.running,
        cached_jobs: state.coordinator.cached_jobs(),
    })
}

/// Stream every `file` field to disk, validate it, and submit one job for all
/// of them.
#[instrument(level = "debug", skip_all)]
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut documents = vec![];
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        if documents.len() == MAX_FILES_PER_UPLOAD {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("at most {} files may be uploaded at once", MAX_FILES_PER_UPLOAD),
            ));
        }
        let filename = field.file_name().unwrap_or("upload").to_owned();
        let mut sink = UploadSink::new(&filename, &state.limits, state.upload_dir.as_deref())?;
        while let Some(chunk) = field.chunk().await? {
            sink.write_chunk(&chunk).await?;
        }
        documents.push(sink.finish().await?);
    }
    if documents.is_empty() {
        return Err(ValidationError::NoDocuments.into());
    }

    let count = documents.len();
    let job_id = state.coordinator.submit(documents)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id,
            status: JobStatus::Pending,
            message: format!("{} document(s) queued for processing", count),
        }),
    ))
}

pub async fn status(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<StatusReport>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.coordinator.status(job_id)?))
}

pub async fn result(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobResultReport>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.coordinator.result(job_id)?))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<StatusReport>> {
    Json(state.coordinator.jobs())
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid job id {:?}", raw)))
}
