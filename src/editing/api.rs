use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stepwright_common::CorrectionSet;

use super::commit::ConfirmationCommitter;
use super::db::DbHandle;
use super::graph::Violation;
use super::lifecycle::{SessionManager, SessionSettings};
use super::login::LoginOrchestrator;
use super::models::{NewSubject, PersistedStep};
use super::remote::AutomationEngine;
use super::sealer::SecretSealer;
use super::ws::{EditingEvent, EventSender, broadcast_event};
use crate::errors::{EditingError, RemoteError};

/// Header carrying the authenticated caller, set by the fronting proxy.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the engine's shared secret on callbacks.
pub const ENGINE_KEY_HEADER: &str = "x-engine-key";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: EventSender,
    pub sessions: SessionManager,
    pub login: LoginOrchestrator,
    pub committer: ConfirmationCommitter,
    pub callback_key: Option<String>,
}

impl AppState {
    pub fn new(
        db: DbHandle,
        engine: Arc<dyn AutomationEngine>,
        sealer: Arc<dyn SecretSealer>,
        settings: SessionSettings,
        callback_key: Option<String>,
    ) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(256);
        let sessions = SessionManager::new(db.clone(), engine, events.clone(), settings);
        Self {
            db,
            events,
            login: LoginOrchestrator::new(sessions.clone()),
            committer: ConfirmationCommitter::new(sessions.clone(), sealer),
            sessions,
            callback_key,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct StartRequest {
    pub url: Option<String>,
}

#[derive(Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Deserialize, Default)]
pub struct ConfirmRequest {
    pub correction_set: Option<CorrectionSet>,
}

#[derive(Deserialize)]
pub struct NavigateRequest {
    pub step_index: usize,
    pub url: String,
}

#[derive(Deserialize)]
pub struct FillFieldRequest {
    pub field_index: usize,
    pub value: String,
}

#[derive(Deserialize)]
pub struct TestSelectorRequest {
    pub selector: String,
}

#[derive(Deserialize)]
pub struct ReadFieldRequest {
    pub field_index: usize,
}

#[derive(Deserialize)]
pub struct EngineEventRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    /// The remote session is gone; the editor must reset.
    Gone(String),
    Unprocessable {
        message: String,
        violations: Vec<Violation>,
    },
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({"error": msg})),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({"error": msg})),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            ApiError::Gone(msg) => (StatusCode::GONE, json!({"error": msg, "reset": true})),
            ApiError::Unprocessable {
                message,
                violations,
            } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({"error": message, "violations": violations}),
            ),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, json!({"error": msg})),
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, json!({"error": msg})),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg})),
        };
        (status, Json(body)).into_response()
    }
}

impl From<EditingError> for ApiError {
    fn from(err: EditingError) -> Self {
        let message = err.to_string();
        match err {
            EditingError::SubjectNotFound { .. } => ApiError::NotFound(message),
            EditingError::Forbidden { .. } => ApiError::Forbidden(message),
            EditingError::InvalidState(_)
            | EditingError::NoActiveSession { .. }
            | EditingError::LoginInProgress { .. }
            | EditingError::LoginNotPaused { .. } => ApiError::Conflict(message),
            EditingError::EmptyDraft => ApiError::Unprocessable {
                message,
                violations: Vec::new(),
            },
            EditingError::Validation(violations) => ApiError::Unprocessable {
                message,
                violations,
            },
            EditingError::SessionLost { .. } => ApiError::Gone(message),
            EditingError::Remote(RemoteError::Rejected(_)) => ApiError::BadRequest(message),
            EditingError::Remote(RemoteError::Timeout { .. }) => ApiError::GatewayTimeout(message),
            EditingError::Remote(RemoteError::Transport(_)) => ApiError::BadGateway(message),
            // Mapped to SessionLost upstream; kept for completeness.
            EditingError::Remote(RemoteError::NotFound) => ApiError::Gone(message),
            EditingError::Sealing(_) | EditingError::Database(_) => {
                tracing::error!(error = %message, "internal error");
                ApiError::Internal(message)
            }
        }
    }
}

/// The calling user, from the `X-User-Id` header.
pub fn principal(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing or invalid X-User-Id header".into()))
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/subjects", get(list_subjects).post(create_subject))
        .route("/api/subjects/{id}", get(get_subject).delete(delete_subject))
        .route("/api/subjects/{id}/steps", get(get_steps))
        .route("/api/subjects/{id}/editing/start", post(start_editing))
        .route("/api/subjects/{id}/editing/resume", post(resume_editing))
        .route(
            "/api/subjects/{id}/editing/draft",
            get(load_draft).put(save_draft),
        )
        .route("/api/subjects/{id}/editing/command", post(send_command))
        .route("/api/subjects/{id}/editing/confirm", post(confirm))
        .route("/api/subjects/{id}/editing/cancel", post(cancel))
        .route("/api/subjects/{id}/editing/execute-login", post(execute_login))
        .route("/api/subjects/{id}/editing/resume-login", post(resume_login))
        .route("/api/subjects/{id}/editing/abort-login", post(abort_login))
        .route("/api/subjects/{id}/editing/navigate-step", post(navigate_step))
        .route("/api/subjects/{id}/editing/fill-field", post(fill_field))
        .route("/api/subjects/{id}/editing/test-selector", post(test_selector))
        .route("/api/subjects/{id}/editing/read-field", post(read_field))
        .route("/api/engine/subjects/{id}/events", post(engine_event))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_subject(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<NewSubject>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    if req.name.trim().is_empty() || req.target_url.trim().is_empty() {
        return Err(ApiError::BadRequest("name and target_url are required".into()));
    }
    let subject = state
        .db
        .call(move |db| db.create_subject(user_id, &req))
        .await
        .map_err(EditingError::from)?;
    tracing::info!(subject_id = subject.id, kind = subject.kind.as_str(), "subject created");
    Ok((StatusCode::CREATED, Json(subject)))
}

async fn list_subjects(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let subjects = state
        .db
        .call(move |db| db.list_subjects(user_id))
        .await
        .map_err(EditingError::from)?;
    Ok(Json(subjects))
}

async fn get_subject(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    Ok(Json(state.sessions.load_owned(user_id, id).await?))
}

async fn delete_subject(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state.sessions.delete(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_steps(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state.sessions.load_owned(user_id, id).await?;
    let steps = state
        .db
        .call(move |db| db.get_steps(id))
        .await
        .map_err(EditingError::from)?;
    let redacted: Vec<PersistedStep> = steps.iter().map(PersistedStep::redacted).collect();
    Ok(Json(redacted))
}

async fn start_editing(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let req: StartRequest = optional_json(&body)?;
    Ok(Json(state.sessions.start(user_id, id, req.url).await?))
}

async fn resume_editing(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    Ok(Json(state.sessions.resume(user_id, id).await?))
}

async fn load_draft(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let draft = state.sessions.load_draft(user_id, id).await?;
    Ok(Json(json!({"draft": draft})))
}

async fn save_draft(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(draft): Json<CorrectionSet>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let version = state.sessions.save_draft(user_id, id, draft).await?;
    Ok(Json(json!({"draft_version": version})))
}

async fn send_command(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("command name is required".into()));
    }
    let result = state
        .sessions
        .command(user_id, id, &req.name, req.payload)
        .await?;
    Ok(Json(result))
}

async fn confirm(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let req: ConfirmRequest = optional_json(&body)?;
    Ok(Json(state.committer.confirm(user_id, id, req.correction_set).await?))
}

async fn cancel(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    Ok(Json(state.sessions.cancel(user_id, id).await?))
}

async fn execute_login(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    // The attempt runs on its own task; progress goes out on the channel.
    state.login.confirm_login_and_proceed(user_id, id).await?;
    let subject = state.sessions.load(id).await?;
    Ok((StatusCode::ACCEPTED, Json(subject)))
}

async fn resume_login(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state.login.resume_login(user_id, id).await?;
    Ok(Json(json!({"resumed": true})))
}

async fn abort_login(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state.login.abort_login(user_id, id).await?;
    Ok(Json(state.sessions.load(id).await?))
}

async fn navigate_step(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<NavigateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state
        .sessions
        .navigate_step(user_id, id, req.step_index, req.url)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fill_field(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<FillFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    state
        .sessions
        .fill_field(user_id, id, req.field_index, &req.value)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_selector(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TestSelectorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    Ok(Json(
        state
            .sessions
            .test_selector(user_id, id, &req.selector)
            .await?,
    ))
}

async fn read_field(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ReadFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal(&headers)?;
    let value = state
        .sessions
        .read_field_value(user_id, id, req.field_index)
        .await?;
    Ok(Json(json!({"value": value})))
}

/// Relay a field notification pushed by the automation engine.
async fn engine_event(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<EngineEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(expected) = state.callback_key.as_deref() else {
        return Err(ApiError::Forbidden("Engine callbacks are not configured".into()));
    };
    let presented = headers
        .get(ENGINE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return Err(ApiError::Unauthorized("Invalid engine key".into()));
    }
    state.sessions.load(id).await?;
    let event = EditingEvent::from_engine(&req.event, req.data)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown engine event '{}'", req.event)))?;
    broadcast_event(&state.events, id, event);
    Ok(StatusCode::ACCEPTED)
}

// ── Tests ─────────────────────────────────────────────────────────────
