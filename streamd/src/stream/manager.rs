//! StreamManager - sole owner and driver of in-flight streams
//!
//! The StreamManager is responsible for:
//! - Minting stream ids and registering lifecycle records
//! - Driving each stream against the LLM backend as a tokio task
//! - Cooperative cancellation via a per-stream token
//! - Emitting every lifecycle event on the bus
//! - Computing metrics at completion
//!
//! Each stream has an emission gate. Chunk and terminal emission from the
//! stream's task, and `cancel_stream`, all hold it while they check state
//! and emit, so exactly one terminal event goes out and nothing follows it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::metrics::compute_metrics;
use crate::events::{
    EventBus, LogLevel, StreamChunk, StreamContext, StreamEmitter, StreamError, StreamEvent, StreamMetadata,
    StreamResult, StreamStatus,
};
use crate::llm::{GenerateOptions, GenerateRequest, LlmBackend, LlmError};

/// Source name on diagnostics emitted by the manager
pub const MANAGER_SOURCE: &str = "stream-manager";

/// What to generate and why
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model: String,
    pub prompt: String,
    pub context: StreamContext,
    pub user_prompt: Option<String>,
    pub context_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub options: Option<GenerateOptions>,
}

impl StreamRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, context: StreamContext) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            context,
            user_prompt: None,
            context_data: None,
            options: None,
        }
    }

    pub fn with_user_prompt(mut self, user_prompt: impl Into<String>) -> Self {
        self.user_prompt = Some(user_prompt.into());
        self
    }

    pub fn with_context_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.context_data = Some(data);
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Point-in-time copy of a registered stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub metadata: StreamMetadata,
    pub prompt: String,
    pub status: StreamStatus,
    pub chunk_count: usize,
    pub content: String,
    pub elapsed_ms: u64,
}

/// Outcome of a backend reachability check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registry-owned lifecycle record; never leaves the manager
struct ActiveStream {
    metadata: StreamMetadata,
    prompt: String,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
    chunks: Vec<StreamChunk>,
    content: String,
    status: StreamStatus,
    started: Instant,
}

impl ActiveStream {
    fn snapshot(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.metadata.stream_id.clone(),
            metadata: self.metadata.clone(),
            prompt: self.prompt.clone(),
            status: self.status,
            chunk_count: self.chunks.len(),
            content: self.content.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// How a stream's execution loop ended
enum Outcome {
    Exhausted,
    Cancelled,
    Failed(LlmError),
}

struct ManagerInner {
    backend: RwLock<Arc<dyn LlmBackend>>,
    bus: EventBus,
    streams: RwLock<HashMap<String, ActiveStream>>,
}

/// Cheap-to-clone handle; clones share one registry
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(backend: Arc<dyn LlmBackend>, bus: EventBus) -> Self {
        debug!(host = %backend.host(), "StreamManager::new: called");
        Self {
            inner: Arc::new(ManagerInner {
                backend: RwLock::new(backend),
                bus,
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Host new streams will be sent to
    pub fn host(&self) -> String {
        self.backend().host().to_string()
    }

    fn backend(&self) -> Arc<dyn LlmBackend> {
        Arc::clone(&self.inner.backend.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn streams(&self) -> RwLockReadGuard<'_, HashMap<String, ActiveStream>> {
        self.inner.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, ActiveStream>> {
        self.inner.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream, emit `stream:started` and begin execution
    ///
    /// Returns the new stream id immediately; everything after that is
    /// reported through events. Must be called within a Tokio runtime.
    pub fn start_stream(&self, request: StreamRequest) -> String {
        let stream_id = Uuid::now_v7().to_string();
        info!(%stream_id, model = %request.model, context = %request.context, "start_stream: called");

        let metadata = StreamMetadata {
            stream_id: stream_id.clone(),
            context: request.context,
            model: request.model.clone(),
            started_at: Utc::now(),
            user_prompt: request.user_prompt.clone(),
            context_data: request.context_data.clone(),
        };
        let backend = self.backend();
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let emitter = self.inner.bus.emitter_for(metadata.clone());

        // A fresh gate is always free. Holding it keeps a concurrent cancel
        // from emitting ahead of `stream:started`.
        let held = Arc::clone(&gate).try_lock_owned().ok();
        self.streams_mut().insert(
            stream_id.clone(),
            ActiveStream {
                metadata,
                prompt: request.prompt.clone(),
                token: token.clone(),
                gate: Arc::clone(&gate),
                chunks: Vec::new(),
                content: String::new(),
                status: StreamStatus::Starting,
                started: Instant::now(),
            },
        );
        emitter.started(&request.prompt);
        drop(held);

        let generate = GenerateRequest {
            model: request.model,
            prompt: request.prompt,
            options: request.options,
        };
        let manager = self.clone();
        let id = stream_id.clone();
        tokio::spawn(async move {
            manager.run_stream(id, generate, backend, token, gate, emitter).await;
        });

        stream_id
    }

    /// Cancel a stream; `false` if it is not registered
    ///
    /// Emits `stream:cancelled` and removes the stream. Calling it again, or
    /// after the stream finished on its own, is a no-op returning `false`.
    pub async fn cancel_stream(&self, stream_id: &str, reason: Option<&str>) -> bool {
        debug!(%stream_id, ?reason, "cancel_stream: called");
        let Some(gate) = self.streams().get(stream_id).map(|s| Arc::clone(&s.gate)) else {
            debug!(%stream_id, "cancel_stream: not found");
            return false;
        };

        let _gate = gate.lock().await;
        let Some(mut entry) = self.streams_mut().remove(stream_id) else {
            debug!(%stream_id, "cancel_stream: finished while waiting");
            return false;
        };

        entry.token.cancel();
        debug_assert!(entry.status.can_transition_to(StreamStatus::Cancelled));
        entry.status = StreamStatus::Cancelled;
        info!(%stream_id, ?reason, chunks = entry.chunks.len(), "cancel_stream: stream cancelled");
        self.inner.bus.emitter_for(entry.metadata).cancelled(reason);
        true
    }

    /// Cancel every registered stream, returning how many were cancelled
    pub async fn cancel_all(&self, reason: Option<&str>) -> usize {
        let ids: Vec<String> = self.streams().keys().cloned().collect();
        debug!(count = ids.len(), ?reason, "cancel_all: called");
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_stream(&id, reason).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn get_stream_info(&self, stream_id: &str) -> Option<StreamInfo> {
        self.streams().get(stream_id).map(ActiveStream::snapshot)
    }

    /// All registered streams, oldest first
    pub fn get_active_streams(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self.streams().values().map(ActiveStream::snapshot).collect();
        // v7 ids sort by creation time
        infos.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        infos
    }

    pub fn get_streams_by_context(&self, context: StreamContext) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self
            .streams()
            .values()
            .filter(|s| s.metadata.context == context)
            .map(ActiveStream::snapshot)
            .collect();
        infos.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        infos
    }

    pub fn active_count(&self) -> usize {
        self.streams().len()
    }

    /// Check the backend by listing its models; never fails
    pub async fn test_connection(&self) -> ConnectionStatus {
        let backend = self.backend();
        debug!(host = %backend.host(), "test_connection: called");
        let status = match backend.list_models().await {
            Ok(models) => {
                info!(host = %backend.host(), model_count = models.len(), "test_connection: connected");
                ConnectionStatus {
                    connected: true,
                    models: models.into_iter().map(|m| m.name).collect(),
                    error: None,
                }
            }
            Err(e) => {
                warn!(host = %backend.host(), error = %e, "test_connection: failed");
                ConnectionStatus {
                    connected: false,
                    models: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let (level, message) = if status.connected {
            (LogLevel::Info, format!("Connected to {}", backend.host()))
        } else {
            (LogLevel::Warn, format!("Cannot reach {}", backend.host()))
        };
        self.inner.bus.emit(StreamEvent::debug_output(
            level,
            MANAGER_SOURCE,
            message,
            serde_json::to_value(&status).ok(),
        ));
        status
    }

    /// Point subsequently started streams at another host
    ///
    /// Streams already running keep the client they started with.
    pub fn update_host(&self, host: &str) -> Result<(), LlmError> {
        let next = self.backend().with_host(host)?;
        info!(host = %next.host(), in_flight = self.active_count(), "update_host: backend replaced");
        *self.inner.backend.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// Task body for one stream
    async fn run_stream(
        self,
        stream_id: String,
        request: GenerateRequest,
        backend: Arc<dyn LlmBackend>,
        token: CancellationToken,
        gate: Arc<Mutex<()>>,
        emitter: StreamEmitter,
    ) {
        debug!(%stream_id, "run_stream: called");
        let outcome = AssertUnwindSafe(self.execute(&stream_id, request, backend.as_ref(), &token, &gate, &emitter))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Outcome::Exhausted) => self.complete(&stream_id, &token, &gate, &emitter).await,
            Ok(Outcome::Failed(e)) => {
                warn!(%stream_id, error = %e, "run_stream: backend failed");
                self.fail(&stream_id, &token, &gate, &emitter, stream_error(&e)).await;
            }
            Ok(Outcome::Cancelled) => debug!(%stream_id, "run_stream: stopped after cancellation"),
            Err(_) => {
                error!(%stream_id, "run_stream: execution panicked");
                let error = StreamError {
                    message: "Stream execution panicked".to_string(),
                    code: Some("internal".to_string()),
                    details: None,
                };
                self.fail(&stream_id, &token, &gate, &emitter, error).await;
            }
        }

        // The entry must never outlive its task
        if self.streams_mut().remove(&stream_id).is_some() {
            warn!(%stream_id, "run_stream: removed entry left without a terminal state");
        }
    }

    /// Pull fragments from the backend until it is done, fails, or the
    /// stream is cancelled
    async fn execute(
        &self,
        stream_id: &str,
        request: GenerateRequest,
        backend: &dyn LlmBackend,
        token: &CancellationToken,
        gate: &Mutex<()>,
        emitter: &StreamEmitter,
    ) -> Outcome {
        if !self.transition(stream_id, StreamStatus::Streaming) {
            return Outcome::Cancelled;
        }

        let mut output = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled,
            result = backend.generate_stream(request) => match result {
                Ok(output) => output,
                Err(e) => return Outcome::Failed(e),
            },
        };

        let mut sequence = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Outcome::Cancelled,
                next = output.next() => next,
            };

            let content = match next {
                None => return Outcome::Exhausted,
                Some(Err(e)) => return Outcome::Failed(e),
                Some(Ok(content)) if content.is_empty() => continue,
                Some(Ok(content)) => content,
            };

            let _gate = gate.lock().await;
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let chunk = StreamChunk {
                stream_id: stream_id.to_string(),
                content,
                sequence,
                timestamp: Utc::now(),
            };
            if !self.record_chunk(&chunk) {
                return Outcome::Cancelled;
            }
            debug!(%stream_id, sequence, "execute: chunk");
            emitter.chunk(chunk);
            sequence += 1;
        }
    }

    fn transition(&self, stream_id: &str, next: StreamStatus) -> bool {
        let mut streams = self.streams_mut();
        match streams.get_mut(stream_id) {
            Some(entry) if entry.status.can_transition_to(next) => {
                debug!(%stream_id, from = %entry.status, to = %next, "transition: called");
                entry.status = next;
                true
            }
            _ => false,
        }
    }

    fn record_chunk(&self, chunk: &StreamChunk) -> bool {
        let mut streams = self.streams_mut();
        match streams.get_mut(&chunk.stream_id) {
            Some(entry) => {
                entry.content.push_str(&chunk.content);
                entry.chunks.push(chunk.clone());
                true
            }
            None => false,
        }
    }

    /// Completion routine: metrics, `stream:completed`, removal
    async fn complete(&self, stream_id: &str, token: &CancellationToken, gate: &Mutex<()>, emitter: &StreamEmitter) {
        let _gate = gate.lock().await;
        if token.is_cancelled() {
            return;
        }
        let Some(mut entry) = self.streams_mut().remove(stream_id) else {
            return;
        };

        entry.status = StreamStatus::Completed;
        let metrics = compute_metrics(entry.chunks.len(), &entry.content, entry.started.elapsed());
        info!(
            %stream_id,
            chunks = metrics.total_chunks,
            bytes = metrics.total_bytes,
            duration_ms = metrics.duration_ms,
            "complete: stream completed"
        );
        emitter.completed(StreamResult {
            stream_id: stream_id.to_string(),
            full_content: entry.content,
            status: entry.status,
            metadata: entry.metadata,
            completed_at: Utc::now(),
            error: None,
            metrics: Some(metrics),
        });
    }

    /// Error routine: `stream:error`, removal; skipped once cancelled
    async fn fail(
        &self,
        stream_id: &str,
        token: &CancellationToken,
        gate: &Mutex<()>,
        emitter: &StreamEmitter,
        error: StreamError,
    ) {
        let _gate = gate.lock().await;
        if token.is_cancelled() {
            debug!(%stream_id, "fail: error after cancellation ignored");
            return;
        }
        if self.streams_mut().remove(stream_id).is_none() {
            return;
        }
        emitter.error(error);
    }
}

/// Describe a backend failure for `stream:error`
pub fn stream_error(e: &LlmError) -> StreamError {
    StreamError {
        message: e.to_string(),
        code: Some(e.code().to_string()),
        details: e.details(),
    }
}
