//! Rendition delivery handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use vingest_models::VideoId;
use vingest_storage::rendition_cache_key;

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_rendition_bytes;
use crate::state::AppState;

/// Path segments may not carry separators or dots.
fn is_plain_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `GET /api/v1/videos/:video_id/renditions/:name`
///
/// Served through the delivery cache; workers invalidate a video's entries
/// when they store new renditions for it.
pub async fn get_rendition(
    State(state): State<AppState>,
    Path((video_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    if !is_plain_segment(&video_id) || !is_plain_segment(&name) {
        return Err(ApiError::bad_request("invalid rendition path"));
    }
    let video_id = VideoId::from_string(video_id);
    let key = format!("{}/{}/{}.mp4", state.config.rendition_prefix, video_id, name);

    let data = state
        .renditions
        .fetch_key(&rendition_cache_key(&video_id, &name), &key)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("rendition {}/{}", video_id, name))
            } else {
                ApiError::internal(e.to_string())
            }
        })?;

    record_rendition_bytes(data.len());
    Ok((
        [(header::CONTENT_TYPE, "video/mp4")],
        Bytes::from(Arc::unwrap_or_clone(data)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_segments() {
        assert!(is_plain_segment("720p"));
        assert!(is_plain_segment("0b4e-video_1"));
        assert!(!is_plain_segment(""));
        assert!(!is_plain_segment(".."));
        assert!(!is_plain_segment("a/b"));
        assert!(!is_plain_segment("720p.mp4"));
    }
}
