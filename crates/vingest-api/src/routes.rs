//! API routes.

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::{BoxError, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::renditions::get_rendition;
use crate::handlers::uploads::{abort_upload, complete_upload, get_upload, init_upload, put_chunk};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let upload_routes = Router::new()
        .route("/uploads", post(init_upload))
        .route("/uploads/:session_id", get(get_upload).delete(abort_upload))
        .route("/uploads/:session_id/chunks/:index", put(put_chunk))
        .route("/uploads/:session_id/complete", post(complete_upload))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .route_layer(middleware::from_fn(metrics_middleware));

    let delivery_routes = Router::new()
        .route("/videos/:video_id/renditions/:name", get(get_rendition))
        .route_layer(middleware::from_fn(metrics_middleware));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    let timeout = state.config.request_timeout;

    Router::new()
        .nest("/api/v1", upload_routes.merge(delivery_routes))
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    StatusCode::GATEWAY_TIMEOUT
                }))
                .timeout(timeout),
        )
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
