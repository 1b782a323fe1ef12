//! Ingest routes: start, fragment upload, finalize, poll.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};

use crate::chunk_store::ChunkStoreError;
use crate::coordinator::{
    Coordinator, CoordinatorError, CreateSessionRequest, FinalizeOutcome, FinalizeRequest,
    SessionView,
};
use crate::fragment::FragmentAck;
use crate::session::{Session, SessionError};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
}

pub fn router(state: AppState, max_fragment_bytes: Option<usize>) -> Router {
    let body_limit = match max_fragment_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(session_status))
        .route("/sessions/:session_id/fragments/:index", put(upload_fragment))
        .route("/sessions/:session_id/finalize", post(finalize_session))
        .layer(body_limit)
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = state.coordinator.create_session(&request)?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn upload_fragment(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u64)>,
    body: Bytes,
) -> Result<Json<FragmentAck>, ApiError> {
    debug!(session_id = %session_id, index, bytes = body.len(), "fragment received");
    let ack = state
        .coordinator
        .accept_fragment(&session_id, index, body)
        .await?;
    Ok(Json(ack))
}

async fn finalize_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<FinalizeRequest>,
) -> Result<(StatusCode, Json<FinalizeOutcome>), ApiError> {
    let outcome = state.coordinator.finalize(&session_id, &request)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.coordinator.status(&session_id)?))
}

#[derive(Debug)]
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn classify(&self) -> (StatusCode, bool) {
        match &self.0 {
            CoordinatorError::Chunks(err) => match err {
                ChunkStoreError::EmptyPayload { .. } => (StatusCode::UNPROCESSABLE_ENTITY, true),
                ChunkStoreError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, false),
                ChunkStoreError::InvalidSession(_) => (StatusCode::BAD_REQUEST, false),
                ChunkStoreError::Io { .. } | ChunkStoreError::Task(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, true)
                }
            },
            CoordinatorError::Session(err) => match err {
                SessionError::NotFound(_) => (StatusCode::NOT_FOUND, false),
                SessionError::OwnerMismatch { .. } => (StatusCode::FORBIDDEN, false),
                SessionError::NotAcceptingFragments { .. }
                | SessionError::InvalidTransition { .. } => (StatusCode::CONFLICT, false),
                SessionError::InvalidStatus(_) | SessionError::MissingStore => {
                    (StatusCode::INTERNAL_SERVER_ERROR, false)
                }
                SessionError::Open { .. } | SessionError::Execute(_) | SessionError::Io(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, true)
                }
            },
            CoordinatorError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, true),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retryable) = self.classify();
        if status.is_server_error() {
            warn!(error = %self.0, %status, "request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "retryable": retryable,
        }));
        (status, body).into_response()
    }
}
