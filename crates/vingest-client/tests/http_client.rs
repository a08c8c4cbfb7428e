//! HTTP transport behind the resilient layer, against a mock server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vingest_client::{
    BreakerConfig, CircuitState, ClientError, HttpUploadService, ResilientClient,
    ResilientUploadService, RetryPolicy, UploadService,
};
use vingest_models::{Checksum, ErrorCode, InitSessionRequest, SessionId};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resilient(server: &MockServer, max_attempts: u32, failure_threshold: u32) -> ResilientUploadService {
    let http = HttpUploadService::new(&server.uri()).unwrap();
    let client = ResilientClient::new(
        "upload-api",
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(|cap| cap),
        BreakerConfig {
            failure_threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            success_threshold: 1,
        },
        Duration::from_secs(5),
    );
    ResilientUploadService::new(Arc::new(http), client)
}

fn ack_body(index: u32) -> serde_json::Value {
    json!({
        "session_id": "sess-1",
        "index": index,
        "received": 1,
        "expected": 4,
        "duplicate": false,
        "missing_indices": [1, 2, 3]
    })
}

#[tokio::test]
async fn test_chunk_send_retries_on_unavailable() {
    let server = MockServer::start().await;
    let payload = b"chunk zero".to_vec();
    let checksum = Checksum::compute(&payload);

    Mock::given(method("PUT"))
        .and(path("/api/v1/uploads/sess-1/chunks/0"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/uploads/sess-1/chunks/0"))
        .and(header("x-chunk-checksum", checksum.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(ack_body(0)))
        .expect(1)
        .mount(&server)
        .await;

    let service = resilient(&server, 4, 10);
    let ack = service
        .send_chunk(&SessionId::from("sess-1"), 0, &payload, &checksum)
        .await
        .unwrap();

    assert_eq!(ack.index, 0);
    assert_eq!(ack.missing_indices, vec![1, 2, 3]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_incomplete_finish_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads/sess-1/complete"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "detail": "Upload incomplete: 2 chunks missing",
            "code": "incomplete",
            "missing_indices": [4, 9]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = resilient(&server, 4, 10);
    let err = service.finish(&SessionId::from("sess-1")).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::Incomplete);
    assert_eq!(err.missing_indices(), Some(&[4, 9][..]));
    assert_eq!(service.client().circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_init_retries_transient_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "detail": "Service unavailable",
            "code": "transient"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "session_id": "sess-2",
            "video_id": "video-2",
            "total_size": 10,
            "chunk_size": 5,
            "expected_chunk_count": 2,
            "expires_at": "2030-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let service = resilient(&server, 3, 10);
    let created = service.init(&InitSessionRequest::new(10, 5)).await.unwrap();
    assert_eq!(created.session_id, SessionId::from("sess-2"));
    assert_eq!(created.expected_chunk_count, 2);
}

#[tokio::test]
async fn test_breaker_opens_and_stops_calling_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/uploads/sess-1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let service = resilient(&server, 1, 3);
    let session = SessionId::from("sess-1");
    for _ in 0..3 {
        let err = service.status(&session).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Transient);
    }

    let err = service.status(&session).await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_not_found_body_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/uploads/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "detail": "Upload session not found: gone",
            "code": "not_found"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let service = resilient(&server, 4, 10);
    let err = service.abort(&SessionId::from("gone")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}
