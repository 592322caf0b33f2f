//! HTTP surface for Rusty Ingest.
//!
//! - `POST /files` queues a document for ingestion and answers `202 Accepted` with the job id.
//! - `GET /files?agent_id=..&user_id=..` lists stored files for an owner.
//! - `GET /files/{document_id}?agent_id=..&user_id=..` returns a document's stored chunks.
//! - `DELETE /files/{document_id}?agent_id=..&user_id=..` removes a document.
//! - `GET /files/{document_id}/status?agent_id=..&user_id=..` reports the latest job's progress
//!   record; another owner's document reads as missing.
//! - `GET /metrics` and `GET /diagnostics` expose queue counters and backend health.

use crate::coordination::FileIngestionProgress;
use crate::manager::{Diagnostics, IngestionApi, ManagerError, ManagerMetrics};
use crate::processing::{ChunkingStrategy, FileIngestionJobData, IngestionOptions};
use crate::queue::QueueError;
use crate::vector_store::{StoredFile, VectorStoreEntry, VectorStoreError};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Build the HTTP router over an ingestion backend.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: IngestionApi + 'static,
{
    Router::new()
        .route("/files", get(list_files::<S>).post(submit_file::<S>))
        .route(
            "/files/:document_id",
            get(get_file::<S>).delete(delete_file::<S>),
        )
        .route("/files/:document_id/status", get(get_status::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/diagnostics", get(get_diagnostics::<S>))
        .with_state(service)
}

/// Request body for `POST /files`.
#[derive(Deserialize)]
struct SubmitFileRequest {
    document_id: String,
    agent_id: String,
    user_id: String,
    original_name: String,
    mime_type: String,
    /// Document text.
    content: String,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    chunk_overlap: Option<usize>,
    #[serde(default)]
    strategy: Option<ChunkingStrategy>,
    #[serde(default)]
    generate_embeddings: Option<bool>,
    #[serde(default)]
    store_vectors: Option<bool>,
}

impl SubmitFileRequest {
    fn into_job(self) -> Result<FileIngestionJobData, AppError> {
        for (field, value) in [
            ("document_id", &self.document_id),
            ("agent_id", &self.agent_id),
            ("user_id", &self.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::BadRequest(format!("`{field}` must not be empty")));
            }
        }
        let defaults = IngestionOptions::default();
        let options = IngestionOptions {
            chunk_size: self.chunk_size,
            overlap: self.chunk_overlap,
            strategy: self.strategy,
            generate_embeddings: self
                .generate_embeddings
                .unwrap_or(defaults.generate_embeddings),
            store_vectors: self.store_vectors.unwrap_or(defaults.store_vectors),
        };
        Ok(FileIngestionJobData::new(
            self.document_id,
            self.agent_id,
            self.user_id,
            self.original_name,
            self.mime_type,
            self.content,
        )
        .with_options(options))
    }
}

#[derive(Serialize)]
struct SubmitFileResponse {
    job_id: String,
    document_id: String,
    deduplicated: bool,
}

async fn submit_file<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SubmitFileRequest>,
) -> Result<(StatusCode, Json<SubmitFileResponse>), AppError>
where
    S: IngestionApi,
{
    let job = request.into_job()?;
    let document_id = job.document_id.clone();
    let enqueued = service.enqueue_file(job).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitFileResponse {
            job_id: enqueued.id,
            document_id,
            deduplicated: enqueued.deduplicated,
        }),
    ))
}

/// Owner scope shared by the file endpoints.
#[derive(Deserialize)]
struct OwnerQuery {
    agent_id: String,
    user_id: String,
}

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<StoredFile>,
}

async fn list_files<S>(
    State(service): State<Arc<S>>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<FilesResponse>, AppError>
where
    S: IngestionApi,
{
    let files = service.list_files(&owner.agent_id, &owner.user_id).await?;
    Ok(Json(FilesResponse { files }))
}

#[derive(Serialize)]
struct FileResponse {
    document_id: String,
    chunks: Vec<VectorStoreEntry>,
}

async fn get_file<S>(
    State(service): State<Arc<S>>,
    Path(document_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<FileResponse>, AppError>
where
    S: IngestionApi,
{
    let chunks = service
        .get_file(&owner.agent_id, &document_id, &owner.user_id)
        .await?;
    Ok(Json(FileResponse {
        document_id,
        chunks,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    removed: usize,
}

async fn delete_file<S>(
    State(service): State<Arc<S>>,
    Path(document_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<DeleteResponse>, AppError>
where
    S: IngestionApi,
{
    let removed = service
        .delete_file(&owner.agent_id, &document_id, &owner.user_id)
        .await?;
    Ok(Json(DeleteResponse {
        document_id,
        removed,
    }))
}

async fn get_status<S>(
    State(service): State<Arc<S>>,
    Path(document_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<FileIngestionProgress>, AppError>
where
    S: IngestionApi,
{
    service
        .get_status(&owner.agent_id, &document_id, &owner.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no ingestion job for '{document_id}'")))
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<ManagerMetrics>
where
    S: IngestionApi,
{
    Json(service.get_metrics().await)
}

async fn get_diagnostics<S>(State(service): State<Arc<S>>) -> Json<Diagnostics>
where
    S: IngestionApi,
{
    Json(service.get_diagnostics().await)
}

enum AppError {
    BadRequest(String),
    NotFound(String),
    Manager(ManagerError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Manager(ManagerError::Store(VectorStoreError::NotFound { .. })) => {
                StatusCode::NOT_FOUND
            }
            Self::Manager(ManagerError::Queue(QueueError::Closed)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::BadRequest(message) | Self::NotFound(message) => message,
            Self::Manager(error) => {
                if status.is_server_error() {
                    tracing::error!(error = %error, "Request failed");
                }
                error.to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ManagerError> for AppError {
    fn from(inner: ManagerError) -> Self {
        Self::Manager(inner)
    }
}
