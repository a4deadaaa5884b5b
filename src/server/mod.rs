//! The HTTP surface in front of the [`JobCoordinator`].

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    jobs::{CacheError, JobCoordinator, ResultError, SubmitError},
    prelude::*,
    upload::{AdmissionError, UploadLimits, ValidationError},
};

mod handlers;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
    pub limits: UploadLimits,
    pub upload_dir: Option<PathBuf>,
}

/// Build our router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/upload", post(handlers::upload))
        .route("/status/:job_id", get(handlers::status))
        .route("/result/:job_id", get(handlers::result))
        .route("/jobs", get(handlers::list_jobs))
        // Uploads are streamed to disk and limited per document instead.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(listen: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot listen on {}", listen))?;
    info!(%listen, "Listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// An error response, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        } else {
            debug!(status = %self.status, "{}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let status = match err {
            ValidationError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Invalid(err) => err.into(),
            AdmissionError::Storage(err) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("could not stage upload: {}", err),
            ),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Invalid(err) => err.into(),
            SubmitError::PoolClosed(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            SubmitError::Cache(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let status = match err {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ResultError> for ApiError {
    fn from(err: ResultError) -> Self {
        let status = match err {
            ResultError::NotFound(_) => StatusCode::NOT_FOUND,
            ResultError::NotReady { .. } => StatusCode::TOO_EARLY,
            ResultError::Failed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("malformed upload: {}", err))
    }
}
