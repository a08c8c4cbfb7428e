//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use vingest_api::{create_router, ApiConfig, AppState};
use vingest_models::Checksum;
use vingest_queue::{
    DispatchConfig, JobDispatcher, MemoryIdempotencyStore, MemoryWorkQueue, WorkSource,
};
use vingest_storage::{LruDeliveryCache, MemoryArtifactStore, MemoryChunkStore, ReadThroughCache};
use vingest_upload::{UploadConfig, UploadSessionManager};

struct Harness {
    router: Router,
    queue: Arc<MemoryWorkQueue>,
}

fn harness() -> Harness {
    let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
    let dispatcher = Arc::new(JobDispatcher::new(
        queue.clone(),
        Arc::new(MemoryIdempotencyStore::new()),
        DispatchConfig::default(),
    ));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let uploads = Arc::new(UploadSessionManager::new(
        UploadConfig::default(),
        Arc::new(MemoryChunkStore::new()),
        artifacts.clone(),
        dispatcher,
    ));
    let renditions = ReadThroughCache::new(
        Arc::new(LruDeliveryCache::new(1024 * 1024, Duration::from_secs(60))),
        artifacts,
    );
    let router = create_router(
        AppState::new(ApiConfig::default(), uploads, renditions),
        None,
    );
    Harness { router, queue }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn chunk_request(session_id: &str, index: u32, payload: &[u8], checksum: &str) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/v1/uploads/{}/chunks/{}", session_id, index))
        .header("content-type", "application/octet-stream")
        .header("x-chunk-checksum", checksum)
        .body(Body::from(payload.to_vec()))
        .unwrap()
}

async fn init(router: &Router, total_size: u64, chunk_size: u64) -> String {
    let (status, body) = send(
        router,
        json_request(
            Method::POST,
            "/api/v1/uploads",
            json!({ "total_size": total_size, "chunk_size": chunk_size }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_out_of_order_upload_completes_and_dispatches() {
    let h = harness();
    let data: Vec<u8> = (0..2_500u32).map(|i| (i % 200) as u8).collect();
    let session = init(&h.router, 2_500, 1_000).await;

    for index in [2u32, 0, 1] {
        let start = index as usize * 1_000;
        let end = (start + 1_000).min(data.len());
        let chunk = &data[start..end];
        let checksum = Checksum::compute(chunk);
        let (status, ack) = send(
            &h.router,
            chunk_request(&session, index, chunk, checksum.as_str()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["index"], index);
    }

    let (status, view) = send(&h.router, empty_request(Method::GET, &format!("/api/v1/uploads/{}", session))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["received_chunks"], 3);
    assert_eq!(view["missing_indices"], json!([]));

    let (status, result) = send(
        &h.router,
        empty_request(Method::POST, &format!("/api/v1/uploads/{}/complete", session)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["size_bytes"], 2_500);
    assert_eq!(result["checksum"], Checksum::compute(&data).as_str());
    assert_eq!(result["dispatch"]["state"], "dispatched");

    let deliveries = h
        .queue
        .poll("test", 10, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job.size_bytes, 2_500);
}

#[tokio::test]
async fn test_incomplete_reports_missing_indices() {
    let h = harness();
    let session = init(&h.router, 3_000, 1_000).await;
    let chunk = vec![7u8; 1_000];
    let checksum = Checksum::compute(&chunk);
    send(&h.router, chunk_request(&session, 1, &chunk, checksum.as_str())).await;

    let (status, body) = send(
        &h.router,
        empty_request(Method::POST, &format!("/api/v1/uploads/{}/complete", session)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "incomplete");
    assert_eq!(body["missing_indices"], json!([0, 2]));
}

#[tokio::test]
async fn test_chunk_errors() {
    let h = harness();
    let session = init(&h.router, 2_000, 1_000).await;
    let chunk = vec![1u8; 1_000];

    // No checksum header
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/v1/uploads/{}/chunks/0", session))
        .body(Body::from(chunk.clone()))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    // Checksum mismatch
    let wrong = Checksum::compute(b"something else");
    let (status, body) = send(&h.router, chunk_request(&session, 0, &chunk, wrong.as_str())).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid");

    // Index out of range
    let checksum = Checksum::compute(&chunk);
    let (status, _) = send(&h.router, chunk_request(&session, 5, &chunk, checksum.as_str())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Duplicate send is a no-op success
    send(&h.router, chunk_request(&session, 0, &chunk, checksum.as_str())).await;
    let (status, ack) = send(&h.router, chunk_request(&session, 0, &chunk, checksum.as_str())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["duplicate"], true);
}

#[tokio::test]
async fn test_abort_then_chunk_conflicts() {
    let h = harness();
    let session = init(&h.router, 2_000, 1_000).await;

    let (status, view) = send(
        &h.router,
        empty_request(Method::DELETE, &format!("/api/v1/uploads/{}", session)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "failed");

    let chunk = vec![0u8; 1_000];
    let checksum = Checksum::compute(&chunk);
    let (status, body) = send(&h.router, chunk_request(&session, 0, &chunk, checksum.as_str())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn test_unknown_session_and_bad_init() {
    let h = harness();

    let (status, body) = send(&h.router, empty_request(Method::GET, "/api/v1/uploads/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = send(
        &h.router,
        json_request(
            Method::POST,
            "/api/v1/uploads",
            json!({ "total_size": 0, "chunk_size": 1_000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = send(&h.router, empty_request(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}
