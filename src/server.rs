//! HTTP API.
//!
//! The inbound surface consumed by the front-end and the sibling services
//! (meeting-result generator, handover digest, spreadsheet add-on). Every
//! route except `/health` requires the pre-shared key in the `X-API-Key`
//! header.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest/folder` | Enqueue a folder scan, returns 202 + task id |
//! | `GET` | `/tasks/{task_id}` | Task state, progress, result |
//! | `DELETE` | `/tasks/{task_id}` | Revoke a task (idempotent, 204) |
//! | `POST` | `/search` | Hybrid retrieval |
//! | `POST` | `/chat` | Conversational turn with sources |
//! | `GET` | `/chat/history/{session_id}` | Session history from the cache |
//! | `DELETE` | `/chat/history/{session_id}` | Clear a session (204) |
//! | `GET` | `/documents` | Paged document listing |
//! | `GET` | `/health` | Liveness, no auth |
//!
//! # Error Contract
//!
//! ```json
//! { "detail": "query must not be empty", "error_code": "invalid_input", "timestamp": "…" }
//! ```

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::chat::{self, ChatOptions};
use crate::context::AppContext;
use crate::documents;
use crate::error::PipelineError;
use crate::ingest::ScanOptions;
use crate::models::{DocType, PipelineStatus};
use crate::queue;
use crate::search::{self, SearchFilters};

type AppState = Arc<AppContext>;

pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/ingest/folder", post(handle_ingest_folder))
        .route(
            "/tasks/{task_id}",
            get(handle_get_task).delete(handle_revoke_task),
        )
        .route("/search", post(handle_search))
        .route("/chat", post(handle_chat))
        .route(
            "/chat/history/{session_id}",
            get(handle_chat_history).delete(handle_delete_history),
        )
        .route("/documents", get(handle_list_documents))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_api_key));

    let app = Router::new()
        .merge(protected)
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx);

    tracing::info!(bind = %bind_addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Auth ============

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if provided != state.config.server.api_key {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid X-API-Key",
        ));
    }

    Ok(next.run(req).await)
}

// ============ Error envelope ============

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    error_code: String,
    timestamp: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.detail,
            error_code: self.code.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InputInvalid(msg) => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_input", msg)
            }
            other => AppError::internal(other.to_string()),
        }
    }
}

// ============ POST /ingest/folder ============

#[derive(Deserialize)]
struct IngestFolderRequest {
    folder_id: String,
    #[serde(default)]
    options: Option<ScanOptions>,
    #[serde(default)]
    #[allow(dead_code)]
    user_level: Option<i32>,
}

#[derive(Serialize)]
struct IngestFolderResponse {
    task_id: Uuid,
}

async fn handle_ingest_folder(
    State(state): State<AppState>,
    Json(req): Json<IngestFolderRequest>,
) -> Result<(StatusCode, Json<IngestFolderResponse>), AppError> {
    if req.folder_id.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "folder_id must not be empty",
        ));
    }

    let options = req.options.unwrap_or_default();
    let task_id = queue::enqueue_ingest_folder(&state.pool, &req.folder_id, &options)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(IngestFolderResponse { task_id })))
}

// ============ Tasks ============

async fn handle_get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<queue::TaskStatus>, AppError> {
    let status = queue::get_task(&state.pool, task_id)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .ok_or_else(|| AppError::not_found(format!("unknown task {}", task_id)))?;
    Ok(Json(status))
}

async fn handle_revoke_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    queue::revoke(&state.pool, task_id)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /search ============

#[derive(Deserialize, Default)]
struct SearchRequestFilters {
    year: Option<i32>,
    department: Option<String>,
    doc_type: Option<String>,
    user_level: Option<i32>,
    semantic_weight: Option<f64>,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    top_k: Option<i64>,
    #[serde(default)]
    filters: Option<SearchRequestFilters>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<search::SearchHit>,
    latency_ms: i64,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let f = req.filters.unwrap_or_default();

    let doc_type = match f.doc_type.as_deref() {
        None => None,
        Some(s) => Some(DocType::parse(s).ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("unknown doc_type: {}", s),
            )
        })?),
    };

    let filters = SearchFilters {
        year: f.year,
        department: f.department,
        doc_type,
        user_level: f.user_level.unwrap_or(1),
        semantic_weight: f.semantic_weight,
    };
    let top_k = req.top_k.unwrap_or(state.config.retrieval.default_top_k);

    let results = search::search(&state, &req.query, top_k, &filters).await?;
    Ok(Json(SearchResponse {
        results: results.hits,
        latency_ms: results.latency_ms,
    }))
}

// ============ Chat ============

#[derive(Deserialize, Default)]
struct ChatRequestOptions {
    top_k: Option<i64>,
    year: Option<i32>,
    department: Option<String>,
    doc_type: Option<String>,
    semantic_weight: Option<f64>,
}

#[derive(Deserialize)]
struct ChatRequest {
    session_id: Option<String>,
    query: String,
    user_level: Option<i32>,
    #[serde(default)]
    options: Option<ChatRequestOptions>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<chat::ChatResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "query must not be empty",
        ));
    }

    let o = req.options.unwrap_or_default();
    let doc_type = o.doc_type.as_deref().and_then(DocType::parse);
    let options = ChatOptions {
        top_k: o.top_k,
        year: o.year,
        department: o.department,
        doc_type,
        semantic_weight: o.semantic_weight,
    };

    let response = chat::chat(
        &state,
        req.session_id,
        &req.query,
        req.user_level.unwrap_or(1),
        &options,
    )
    .await?;

    Ok(Json(response))
}

#[derive(Serialize)]
struct HistoryResponse {
    turns: Vec<chat::ChatTurn>,
    turn_count: usize,
}

async fn handle_chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let turns = state.sessions.history(&session_id);
    let turn_count = turns.len();
    Json(HistoryResponse { turns, turn_count })
}

async fn handle_delete_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.sessions.delete(&session_id);
    StatusCode::NO_CONTENT
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct DocumentsQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    status: Option<String>,
}

fn default_limit() -> i64 {
    50
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(q): Query<DocumentsQuery>,
) -> Result<Json<documents::DocumentPage>, AppError> {
    let status = match q.status.as_deref() {
        None => None,
        Some(s) => Some(PipelineStatus::parse(s).ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                format!("unknown status: {}", s),
            )
        })?),
    };

    let page = documents::list_documents(&state.pool, q.skip, q.limit, status)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(page))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
