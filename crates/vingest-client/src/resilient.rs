//! The call loop shared by every remote operation.
//!
//! Each attempt asks the breaker for a permit, runs under the per-call
//! timeout, reports the outcome to the breaker, and on a retryable error sleeps
//! for a jittered backoff before the next attempt. Business errors such as
//! `Incomplete` or `Conflict` are healthy responses for the breaker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use vingest_models::{
    Checksum, ChunkAck, ChunkIndex, CompletionEvent, CompletionResult, InitSessionRequest, JobId,
    SessionCreated, SessionId, SessionStatusView,
};
use vingest_queue::{CompletionSink, QueueError, QueueResult};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::metrics::{record_attempt_latency, record_call, record_retry, record_short_circuit};
use crate::retry::{CallKind, RetryPolicy};
use crate::service::{DispatchService, UploadService};

/// Timeout, retry and circuit breaking for one dependency.
#[derive(Debug)]
pub struct ResilientClient {
    dependency: String,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        dependency: impl Into<String>,
        policy: RetryPolicy,
        breaker: BreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        let dependency = dependency.into();
        Self {
            breaker: CircuitBreaker::new(dependency.clone(), breaker),
            dependency,
            policy,
            call_timeout,
        }
    }

    pub fn from_config(dependency: impl Into<String>, config: &ClientConfig) -> Self {
        Self::new(
            dependency,
            config.retry.clone(),
            config.breaker.clone(),
            config.call_timeout,
        )
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run `attempt` until it succeeds, fails terminally, or the budget is spent.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        kind: CallKind,
        attempt: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        self.call_counted(operation, kind, attempt).await.0
    }

    /// Like [`call`](Self::call), also returning the number of attempts that
    /// reached the dependency.
    pub async fn call_counted<T, F, Fut>(
        &self,
        operation: &'static str,
        kind: CallKind,
        mut attempt_fn: F,
    ) -> (ClientResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.breaker.try_acquire().is_none() {
                record_short_circuit(&self.dependency, operation);
                record_call(&self.dependency, operation, "circuit_open");
                return (
                    Err(ClientError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    }),
                    attempt,
                );
            }
            attempt += 1;

            let started = Instant::now();
            let result = match tokio::time::timeout(self.call_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::DeadlineExceeded {
                    operation,
                    timeout: self.call_timeout,
                }),
            };
            record_attempt_latency(&self.dependency, operation, started.elapsed().as_secs_f64());

            let error = match result {
                Ok(value) => {
                    self.breaker.on_success();
                    record_call(&self.dependency, operation, "success");
                    return (Ok(value), attempt);
                }
                Err(error) => error,
            };

            if error.is_dependency_failure() {
                self.breaker.on_failure();
            } else {
                self.breaker.on_success();
            }

            if !self.policy.should_retry(&error, kind, attempt) {
                debug!(
                    dependency = %self.dependency,
                    operation,
                    attempt,
                    code = %error.code(),
                    "Call failed"
                );
                record_call(&self.dependency, operation, error.code().as_str());
                return (Err(error), attempt);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                dependency = %self.dependency,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying call"
            );
            record_retry(&self.dependency, operation);
            tokio::time::sleep(delay).await;
        }
    }
}

/// [`UploadService`] with every operation routed through a [`ResilientClient`].
pub struct ResilientUploadService {
    inner: Arc<dyn UploadService>,
    client: ResilientClient,
}

impl ResilientUploadService {
    pub fn new(inner: Arc<dyn UploadService>, client: ResilientClient) -> Self {
        Self { inner, client }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }
}

#[async_trait]
impl UploadService for ResilientUploadService {
    async fn init(&self, request: &InitSessionRequest) -> ClientResult<SessionCreated> {
        self.client
            .call("init", CallKind::NonIdempotent, || self.inner.init(request))
            .await
    }

    async fn send_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        payload: &[u8],
        checksum: &Checksum,
    ) -> ClientResult<ChunkAck> {
        self.client
            .call("send_chunk", CallKind::Idempotent, || {
                self.inner.send_chunk(session_id, index, payload, checksum)
            })
            .await
    }

    async fn finish(&self, session_id: &SessionId) -> ClientResult<CompletionResult> {
        self.client
            .call("finish", CallKind::NonIdempotent, || self.inner.finish(session_id))
            .await
    }

    async fn status(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        self.client
            .call("status", CallKind::Idempotent, || self.inner.status(session_id))
            .await
    }

    async fn abort(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        self.client
            .call("abort", CallKind::NonIdempotent, || self.inner.abort(session_id))
            .await
    }
}

/// [`DispatchService`] behind a [`ResilientClient`].
///
/// Also usable as the upload side's [`CompletionSink`], so dispatch from the
/// session manager shares the same breaker.
pub struct ResilientDispatchService {
    inner: Arc<dyn DispatchService>,
    client: ResilientClient,
}

impl ResilientDispatchService {
    pub fn new(inner: Arc<dyn DispatchService>, client: ResilientClient) -> Self {
        Self { inner, client }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }
}

#[async_trait]
impl DispatchService for ResilientDispatchService {
    async fn dispatch(&self, event: &CompletionEvent) -> ClientResult<JobId> {
        self.client
            .call("dispatch", CallKind::Idempotent, || self.inner.dispatch(event))
            .await
    }
}

#[async_trait]
impl CompletionSink for ResilientDispatchService {
    async fn submit(&self, event: &CompletionEvent) -> QueueResult<JobId> {
        let (result, attempts) = self
            .client
            .call_counted("dispatch", CallKind::Idempotent, || self.inner.dispatch(event))
            .await;
        result.map_err(|e| QueueError::DispatchFailed {
            job_id: JobId::for_session(&event.session_id).to_string(),
            attempts,
            last_error: e.to_string(),
        })
    }
}
