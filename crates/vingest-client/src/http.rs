//! HTTP transport for the upload API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use vingest_models::{
    Checksum, ChunkAck, ChunkIndex, CompletionResult, ErrorBody, ErrorCode, InitSessionRequest,
    SessionCreated, SessionId, SessionStatusView,
};

use crate::error::{ClientError, ClientResult};
use crate::service::UploadService;

/// Header carrying the SHA-256 of a chunk body.
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

const UPLOADS_PATH: &str = "api/v1/uploads";

// =============================================================================
// Client
// =============================================================================

/// [`UploadService`] over the JSON HTTP API.
///
/// Carries no overall request timeout; the resilient layer owns deadlines.
#[derive(Clone)]
pub struct HttpUploadService {
    http: Client,
    base_url: Url,
}

impl HttpUploadService {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("vingest-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Input(format!("http client: {}", e)))?;
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> ClientResult<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ClientError::Input(format!("base url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, suffix: &str) -> ClientResult<Url> {
        let path = if suffix.is_empty() {
            UPLOADS_PATH.to_string()
        } else {
            format!("{}/{}", UPLOADS_PATH, suffix)
        };
        self.base_url
            .join(&path)
            .map_err(|e| ClientError::Input(format!("endpoint {}: {}", path, e)))
    }

    async fn send(&self, request: RequestBuilder) -> ClientResult<Response> {
        request.send().await.map_err(classify_send_error)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Interrupted(format!("reading body: {}", e)))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()));
        }

        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.into()),
            Err(_) => {
                let text = String::from_utf8_lossy(&bytes);
                debug!(status = %status, body = %text, "Unstructured error response");
                Err(ClientError::service(
                    code_for_status(status),
                    format!("HTTP {}: {}", status.as_u16(), text.trim()),
                ))
            }
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> ClientError {
    if error.is_connect() || error.is_builder() {
        ClientError::Transport(error.to_string())
    } else {
        ClientError::Interrupted(error.to_string())
    }
}

/// Fallback classification for responses without an error body.
fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Invalid,
        StatusCode::GATEWAY_TIMEOUT => ErrorCode::DeadlineExceeded,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::Transient,
        s if s.is_server_error() => ErrorCode::Transient,
        _ => ErrorCode::InvalidArgument,
    }
}

#[async_trait]
impl UploadService for HttpUploadService {
    async fn init(&self, request: &InitSessionRequest) -> ClientResult<SessionCreated> {
        let url = self.endpoint("")?;
        let response = self.send(self.http.post(url).json(request)).await?;
        Self::decode(response).await
    }

    async fn send_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        payload: &[u8],
        checksum: &Checksum,
    ) -> ClientResult<ChunkAck> {
        let url = self.endpoint(&format!("{}/chunks/{}", session_id, index))?;
        let request = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_CHECKSUM_HEADER, checksum.as_str())
            .body(payload.to_vec());
        let response = self.send(request).await?;
        Self::decode(response).await
    }

    async fn finish(&self, session_id: &SessionId) -> ClientResult<CompletionResult> {
        let url = self.endpoint(&format!("{}/complete", session_id))?;
        let response = self.send(self.http.post(url)).await?;
        Self::decode(response).await
    }

    async fn status(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        let url = self.endpoint(session_id.as_str())?;
        let response = self.send(self.http.get(url)).await?;
        Self::decode(response).await
    }

    async fn abort(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        let url = self.endpoint(session_id.as_str())?;
        let response = self.send(self.http.delete(url)).await?;
        Self::decode(response).await
    }
}
