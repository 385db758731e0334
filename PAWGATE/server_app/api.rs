use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pawgate_learning::{EvaluationMetrics, ModelConfig};
use pawgate_serving::{
    AppState, ClassLabel, ClassifyResponse, DatasetOverview, PredictionStatistics, RetrainStatus,
    ServiceStatus, ServingError, UploadReport, UploadedFile,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;

/// State handed to every handler.
pub type SharedState = Arc<AppState>;

/// Error rendered as `{"error": message, "status": code}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Failure raised by a serving component.
    #[error(transparent)]
    Serving(#[from] ServingError),
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),
    /// Handler plumbing failure.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status of the error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Serving(err) => StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::BadRequest(format!("malformed multipart body: {err}"))
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        Self::Internal(format!("request task failed: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// Builds the API router: `/health` at the root, everything else under
/// `config.api_prefix`.
pub fn router(state: SharedState, config: &ServerConfig) -> Router {
    let api_routes = Router::new()
        .route("/predict", post(predict))
        .route("/upload-training-data", post(upload_training_data))
        .route("/retrain", post(retrain))
        .route("/retrain-status", get(retrain_status))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/model-config", get(model_config))
        .route("/dataset-stats", get(dataset_stats))
        .route("/prediction-stats", get(prediction_stats));

    let prefix = config.api_prefix.trim_end_matches('/');
    let app = Router::new().route("/health", get(health));
    let app = if prefix.is_empty() {
        app.merge(api_routes)
    } else {
        app.nest(prefix, api_routes)
    };
    let mut app = app
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state);

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if config.enable_tracing {
        app = app.layer(TraceLayer::new_for_http());
    }

    app
}

/// Serves the API until `shutdown` resolves.
pub async fn serve(
    state: SharedState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, prefix = %config.api_prefix, "pawgate API listening");
    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving HTTP")?;
    tracing::info!("pawgate API stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

async fn read_file(field: axum::extract::multipart::Field<'_>) -> Result<UploadedFile, ApiError> {
    let filename = field.file_name().map(str::to_string);
    let content_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await?.to_vec();
    Ok(UploadedFile {
        filename,
        content_type,
        bytes,
    })
}

async fn predict(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<ClassifyResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            upload = Some(read_file(field).await?);
            break;
        }
    }
    let upload = upload.ok_or_else(|| ApiError::BadRequest("missing multipart field 'file'".into()))?;
    if !upload.is_image() {
        return Err(ServingError::InvalidInput("File must be an image".into()).into());
    }
    let response = tokio::task::spawn_blocking(move || state.classify(&upload.bytes)).await??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    class_name: Option<String>,
}

async fn upload_training_data(
    State(state): State<SharedState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadReport>, ApiError> {
    let mut files = Vec::new();
    let mut form_class = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("files" | "file") => files.push(read_file(field).await?),
            Some("class_name") => form_class = Some(field.text().await?),
            _ => {}
        }
    }
    let label: ClassLabel = query
        .class_name
        .or(form_class)
        .as_deref()
        .unwrap_or("cats")
        .parse()?;
    if files.is_empty() {
        return Err(ApiError::BadRequest("no files uploaded".into()));
    }
    let report = tokio::task::spawn_blocking(move || {
        state.retrain.dataset().store_batch(&files, label)
    })
    .await?;
    tracing::info!(
        class = %label,
        uploaded = report.uploaded_count,
        rejected = report.errors.len(),
        "training data uploaded"
    );
    Ok(Json(report))
}

async fn retrain(State(state): State<SharedState>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let _job = state.retrain.spawn()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Retraining started", "status": "processing" })),
    ))
}

async fn retrain_status(State(state): State<SharedState>) -> Json<RetrainStatus> {
    Json(state.retrain.status())
}

async fn status(State(state): State<SharedState>) -> Json<ServiceStatus> {
    Json(state.status())
}

async fn metrics(State(state): State<SharedState>) -> Result<Json<EvaluationMetrics>, ApiError> {
    Ok(Json(state.metrics()?))
}

async fn model_config(State(state): State<SharedState>) -> Result<Json<ModelConfig>, ApiError> {
    Ok(Json(state.model_config()?))
}

async fn dataset_stats(State(state): State<SharedState>) -> Result<Json<DatasetOverview>, ApiError> {
    let overview = tokio::task::spawn_blocking(move || state.dataset_overview()).await?;
    Ok(Json(overview))
}

async fn prediction_stats(
    State(state): State<SharedState>,
) -> Result<Json<PredictionStatistics>, ApiError> {
    let stats = tokio::task::spawn_blocking(move || state.inference.prediction_statistics()).await??;
    Ok(Json(stats))
}
