//! Request/response facade over the stream manager
//!
//! For callers that want "prompt in, text out" and do not care about
//! fan-out. Every call still runs as a regular stream, so the debug terminal
//! and session log see it like any other.

use eyre::{Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{EventType, StreamContext, StreamEvent, Subscription};
use crate::stream::{StreamManager, StreamRequest};

/// Cancellation reason when the caller stops waiting for a result
const CALLER_DROPPED: &str = "caller dropped";

#[derive(Clone)]
pub struct SimpleClient {
    manager: StreamManager,
    context: StreamContext,
}

impl SimpleClient {
    pub fn new(manager: StreamManager) -> Self {
        Self {
            manager,
            context: StreamContext::UserChat,
        }
    }

    /// Tag streams started by this client with another context
    pub fn with_context(mut self, context: StreamContext) -> Self {
        self.context = context;
        self
    }

    /// Generate and return the full response
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        self.generate_with_callback(model, prompt, |_| {}).await
    }

    /// Generate, calling `on_chunk` with each fragment as it arrives
    ///
    /// Resolves to the full response. A stream that errors or is cancelled
    /// resolves to `Err`.
    pub async fn generate_with_callback<F>(&self, model: &str, prompt: &str, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        debug!(%model, prompt_len = prompt.len(), "generate_with_callback: called");

        // Subscribe before starting: on a multi-threaded runtime the first
        // chunk can be emitted before start_stream returns.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.manager.bus().subscribe_to_types(
            [
                EventType::StreamChunk,
                EventType::StreamCompleted,
                EventType::StreamError,
                EventType::StreamCancelled,
            ],
            move |event| {
                let _ = tx.send(event.clone());
                Ok(())
            },
        );

        let stream_id = self
            .manager
            .start_stream(StreamRequest::new(model, prompt, self.context));
        let mut pending = PendingStream {
            manager: self.manager.clone(),
            stream_id,
            subscription,
            finished: false,
        };

        let outcome = loop {
            let Some(event) = rx.recv().await else {
                break Err(eyre!("Event bus closed before stream {} finished", pending.stream_id));
            };
            if event.stream_id() != Some(pending.stream_id.as_str()) {
                continue;
            }
            let result = match event {
                StreamEvent::Chunk { chunk, .. } => {
                    on_chunk(&chunk.content);
                    continue;
                }
                StreamEvent::Completed { result } => Ok(result.full_content),
                StreamEvent::Error { error, .. } => Err(eyre!("Generation failed: {}", error.message)),
                StreamEvent::Cancelled { reason, .. } => Err(match reason {
                    Some(reason) => eyre!("Generation cancelled: {}", reason),
                    None => eyre!("Generation cancelled"),
                }),
                _ => continue,
            };
            pending.finished = true;
            break result;
        };

        debug!(stream_id = %pending.stream_id, ok = outcome.is_ok(), "generate_with_callback: finished");
        outcome
    }

    /// Names of the models the backend offers
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let status = self.manager.test_connection().await;
        if status.connected {
            Ok(status.models)
        } else {
            Err(eyre!(
                "Cannot list models: {}",
                status.error.unwrap_or_else(|| "not connected".to_string())
            ))
        }
    }
}

/// A stream started by the facade, released when the call ends
///
/// Dropping it unsubscribes. If no terminal event was seen (the caller
/// dropped the future, e.g. on a timeout) the stream is cancelled too.
struct PendingStream {
    manager: StreamManager,
    stream_id: String,
    subscription: Subscription,
    finished: bool,
}

impl Drop for PendingStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        if self.finished {
            return;
        }

        debug!(stream_id = %self.stream_id, "PendingStream::drop: caller went away, cancelling");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(stream_id = %self.stream_id, "PendingStream::drop: no runtime, stream left running");
            return;
        };
        let manager = self.manager.clone();
        let stream_id = std::mem::take(&mut self.stream_id);
        handle.spawn(async move {
            manager.cancel_stream(&stream_id, Some(CALLER_DROPPED)).await;
        });
    }
}
