//! Upload session handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::debug;
use vingest_client::http::CHUNK_CHECKSUM_HEADER;
use vingest_models::{
    ChunkAck, ChunkIndex, CompletionResult, InitSessionRequest, SessionCreated, SessionId,
    SessionStatusView,
};

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_chunk_bytes;
use crate::state::AppState;

/// `POST /api/v1/uploads`
pub async fn init_upload(
    State(state): State<AppState>,
    Json(request): Json<InitSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionCreated>)> {
    let created = state.uploads.init_session(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PUT /api/v1/uploads/:session_id/chunks/:index`
///
/// Raw chunk bytes in the body; SHA-256 hex in `x-chunk-checksum`.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, ChunkIndex)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ChunkAck>> {
    let checksum = headers
        .get(CHUNK_CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing {} header", CHUNK_CHECKSUM_HEADER)))?;

    debug!(session_id = %session_id, index, bytes = body.len(), "Chunk received");
    record_chunk_bytes(body.len());

    let ack = state
        .uploads
        .accept_chunk(&SessionId::from_string(session_id), index, body.to_vec(), checksum)
        .await?;
    Ok(Json(ack))
}

/// `POST /api/v1/uploads/:session_id/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CompletionResult>> {
    let result = state
        .uploads
        .finish_session(&SessionId::from_string(session_id))
        .await?;
    Ok(Json(result))
}

/// `GET /api/v1/uploads/:session_id`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatusView>> {
    let view = state
        .uploads
        .session_status(&SessionId::from_string(session_id))
        .await?;
    Ok(Json(view))
}

/// `DELETE /api/v1/uploads/:session_id`
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatusView>> {
    let view = state
        .uploads
        .abort_session(&SessionId::from_string(session_id))
        .await?;
    Ok(Json(view))
}
