//! HTTP surface for Rusty Brief.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `GET /health` – Liveness probe.
//! - `POST /batches` – Start (or resume) a batch over a local directory or a remote folder. The
//!   pass runs in the background; the response carries the batch id to poll. A batch that already
//!   has a running pass answers `409 Conflict`.
//! - `POST /batches/{batch_id}/retry` – Re-attempt only the failed items of a batch, in the
//!   background.
//! - `GET /batches/{batch_id}/checkpoint` – Counts and failure details for a batch.
//! - `GET /batches/{batch_id}/manifest` – Every terminal outcome of a batch.
//! - `GET /metrics` – Process-wide processing counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.

use crate::model::{BatchSource, PageWindow, RunSettings, Sampling};
use crate::orchestrator::{BatchApi, BatchError};
use crate::source::drive::extract_folder_id;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Build the HTTP router exposing the batch API surface.
///
/// `default_language` applies to batch requests that do not name a language.
pub fn create_router<S>(service: Arc<S>, default_language: impl Into<String>) -> Router
where
    S: BatchApi + 'static,
{
    let state = AppState {
        service,
        default_language: Arc::from(default_language.into()),
    };
    Router::new()
        .route("/health", get(health))
        .route("/batches", post(start_batch::<S>))
        .route("/batches/:batch_id/retry", post(retry_batch::<S>))
        .route("/batches/:batch_id/checkpoint", get(get_checkpoint::<S>))
        .route("/batches/:batch_id/manifest", get(get_manifest::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .with_state(state)
}

struct AppState<S> {
    service: Arc<S>,
    default_language: Arc<str>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            default_language: self.default_language.clone(),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Request body for the `POST /batches` endpoint.
#[derive(Deserialize)]
struct BatchRequest {
    /// Local directory to describe.
    #[serde(default)]
    local_path: Option<PathBuf>,
    /// Remote folder id or folder URL to describe.
    #[serde(default)]
    folder: Option<String>,
    /// Output language code.
    #[serde(default)]
    language: Option<String>,
    /// Page window; omitted means two leading and two trailing pages.
    #[serde(default)]
    pages: Option<PageWindow>,
    /// Sampling overrides.
    #[serde(default)]
    sampling: Option<Sampling>,
}

/// Response for endpoints that start a background pass.
#[derive(Serialize)]
struct AcceptedResponse {
    batch_id: String,
    status: &'static str,
}

/// Start a pass over the requested source in the background.
async fn start_batch<S>(
    State(state): State<AppState<S>>,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError>
where
    S: BatchApi + 'static,
{
    let source = match (request.local_path, request.folder) {
        (Some(root), None) => BatchSource::Local { root },
        (None, Some(folder)) => BatchSource::Drive {
            folder_id: extract_folder_id(&folder),
        },
        _ => {
            return Err(AppError::BadRequest(
                "exactly one of `local_path` or `folder` is required".into(),
            ));
        }
    };
    let language = request
        .language
        .filter(|language| !language.trim().is_empty())
        .unwrap_or_else(|| state.default_language.to_string());
    let settings = RunSettings {
        language,
        pages: request.pages.unwrap_or_default(),
        sampling: request.sampling.unwrap_or_default(),
    };

    let description = source.to_string();
    let batch_id = state.service.start_batch(source, settings).await?;
    tracing::info!(batch_id = %batch_id, source = %description, "Batch request accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            batch_id,
            status: "started",
        }),
    ))
}

/// Re-attempt the failed items of a batch in the background.
async fn retry_batch<S>(
    State(state): State<AppState<S>>,
    Path(batch_id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError>
where
    S: BatchApi + 'static,
{
    state.service.start_retry(&batch_id).await?;
    tracing::info!(batch_id = %batch_id, "Retry request accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            batch_id,
            status: "retrying",
        }),
    ))
}

async fn get_checkpoint<S>(
    State(state): State<AppState<S>>,
    Path(batch_id): Path<String>,
) -> Result<Response, AppError>
where
    S: BatchApi,
{
    match state.service.checkpoint_status(&batch_id).await? {
        Some(progress) => Ok(Json(progress).into_response()),
        None => Err(BatchError::NotFound(batch_id).into()),
    }
}

async fn get_manifest<S>(
    State(state): State<AppState<S>>,
    Path(batch_id): Path<String>,
) -> Result<Response, AppError>
where
    S: BatchApi,
{
    match state.service.manifest(&batch_id).await? {
        Some(manifest) => Ok(Json(manifest).into_response()),
        None => Err(BatchError::NotFound(batch_id).into()),
    }
}

/// Return the processing counters accumulated since startup.
async fn get_metrics<S>(State(state): State<AppState<S>>) -> Response
where
    S: BatchApi,
{
    Json(state.service.metrics_snapshot()).into_response()
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "start_batch",
                method: "POST",
                path: "/batches",
                description: "Describe every document under a local directory or remote folder. \
                              Resumes from the stored checkpoint and retries earlier failures. \
                              Responds 202 with the batch id, or 409 while the batch is running.",
                request_example: Some(json!({
                    "folder": "https://drive.google.com/drive/folders/1AbC",
                    "language": "en",
                    "pages": { "mode": "window", "leading": 2, "trailing": 2 },
                    "sampling": { "max_tokens": 300, "temperature": 0.1, "top_p": 0.9 }
                })),
            },
            CommandDescriptor {
                name: "retry_failed",
                method: "POST",
                path: "/batches/{batch_id}/retry",
                description: "Re-attempt only the failed items of a batch. \
                              Processed items are never touched.",
                request_example: None,
            },
            CommandDescriptor {
                name: "checkpoint",
                method: "GET",
                path: "/batches/{batch_id}/checkpoint",
                description: "Return processed, failed, and pending counts plus failure details.",
                request_example: None,
            },
            CommandDescriptor {
                name: "manifest",
                method: "GET",
                path: "/batches/{batch_id}/manifest",
                description: "Return every terminal outcome of a batch in discovery order.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return processing counters useful for observability dashboards.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    BadRequest(String),
    Batch(BatchError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Batch(error) => {
                let status = match &error {
                    BatchError::NotFound(_) => StatusCode::NOT_FOUND,
                    BatchError::Busy(_) => StatusCode::CONFLICT,
                    BatchError::Discovery(_) => StatusCode::BAD_GATEWAY,
                    BatchError::Checkpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BatchError> for AppError {
    fn from(inner: BatchError) -> Self {
        Self::Batch(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::checkpoint::{BatchStatus, CheckpointProgress};
    use crate::manifest::Manifest;
    use crate::metrics::MetricsSnapshot;
    use crate::model::{BatchSource, PageWindow, RunSettings};
    use crate::orchestrator::{BatchApi, BatchError};
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use std::sync::Arc;
    use time::OffsetDateTime;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[tokio::test]
    async fn commands_catalog_exposes_batch_endpoints() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let start = commands
            .iter()
            .find(|cmd| cmd.name == "start_batch")
            .expect("start_batch command present");

        assert_eq!(start.method, "POST");
        assert_eq!(start.path, "/batches");
        assert!(commands.iter().any(|cmd| cmd.name == "retry_failed"));
    }

    #[tokio::test]
    async fn start_batch_resolves_folder_urls_and_defaults() {
        let service = Arc::new(StubBatchService::default());
        let app = create_router(service.clone(), "es");

        let payload = json!({
            "folder": "https://drive.google.com/drive/folders/abc123?usp=sharing",
            "pages": { "mode": "all" }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(json["batch_id"], "abc123");

        let runs = service.runs.lock().await.clone();
        assert_eq!(
            runs[0].0,
            BatchSource::Drive {
                folder_id: "abc123".into()
            }
        );
        assert_eq!(runs[0].1.language, "es");
        assert_eq!(runs[0].1.pages, PageWindow::All);
    }

    #[tokio::test]
    async fn start_batch_requires_exactly_one_source() {
        let app = create_router(Arc::new(StubBatchService::default()), "es");
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "language": "en" }).to_string()))
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_batches_are_not_found() {
        let app = create_router(Arc::new(StubBatchService::default()), "es");
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/batches/missing/checkpoint")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches/missing/retry")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn checkpoint_route_returns_progress() {
        let service = Arc::new(StubBatchService {
            known: Some(progress("known")),
            ..StubBatchService::default()
        });
        let app = create_router(service, "es");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/batches/known/checkpoint")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(json["batch_id"], "known");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["pending"], 2);
    }

    #[tokio::test]
    async fn starts_over_a_running_batch_conflict() {
        let service = Arc::new(StubBatchService {
            known: Some(progress("busy")),
            running: vec!["busy".into()],
            ..StubBatchService::default()
        });
        let app = create_router(service.clone(), "es");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "folder": "busy" }).to_string()))
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(json["error"], "batch busy is already running");

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches/busy/retry")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(service.runs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn retry_of_a_known_batch_is_accepted() {
        let service = Arc::new(StubBatchService {
            known: Some(progress("known")),
            ..StubBatchService::default()
        });
        let app = create_router(service, "es");
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/batches/known/retry")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    fn progress(batch_id: &str) -> CheckpointProgress {
        let now = OffsetDateTime::now_utc();
        CheckpointProgress {
            batch_id: batch_id.into(),
            source: BatchSource::Drive {
                folder_id: batch_id.into(),
            },
            status: BatchStatus::InProgress,
            total_items: 3,
            processed: 1,
            failed: 0,
            pending: 2,
            percent_complete: 33,
            created_at: now,
            updated_at: now,
            failures: Vec::new(),
        }
    }

    /// Records start requests. Batches named in `running` refuse new passes.
    #[derive(Default)]
    struct StubBatchService {
        runs: Mutex<Vec<(BatchSource, RunSettings)>>,
        known: Option<CheckpointProgress>,
        running: Vec<String>,
    }

    impl StubBatchService {
        fn claim(&self, batch_id: &str) -> Result<(), BatchError> {
            if self.running.iter().any(|running| running == batch_id) {
                return Err(BatchError::Busy(batch_id.to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BatchApi for StubBatchService {
        async fn start_batch(
            &self,
            source: BatchSource,
            settings: RunSettings,
        ) -> Result<String, BatchError> {
            let batch_id = source.batch_id();
            self.claim(&batch_id)?;
            self.runs.lock().await.push((source, settings));
            Ok(batch_id)
        }

        async fn start_retry(&self, batch_id: &str) -> Result<(), BatchError> {
            self.claim(batch_id)?;
            match self.checkpoint_status(batch_id).await? {
                Some(_) => Ok(()),
                None => Err(BatchError::NotFound(batch_id.to_string())),
            }
        }

        async fn checkpoint_status(
            &self,
            batch_id: &str,
        ) -> Result<Option<CheckpointProgress>, BatchError> {
            Ok(self
                .known
                .clone()
                .filter(|progress| progress.batch_id == batch_id))
        }

        async fn manifest(&self, _batch_id: &str) -> Result<Option<Manifest>, BatchError> {
            Ok(None)
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot::default()
        }
    }
}
