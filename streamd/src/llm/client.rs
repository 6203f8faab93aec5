//! LlmBackend trait definition

use std::sync::Arc;

use async_trait::async_trait;

use super::{GenerateRequest, GenerateResponse, LlmError, ModelInfo, TextStream};

/// Handle to a text-generation server
///
/// Each call is independent; no conversation state is kept between calls.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Base URL this client talks to
    fn host(&self) -> &str;

    /// List the models available on the server
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;

    /// Generate a complete response (blocking until done)
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;

    /// Start a streaming generation
    ///
    /// Resolves once the server has accepted the request; the returned stream
    /// yields non-empty text fragments in order and ends after the final one.
    /// Dropping the stream abandons the request.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, LlmError>;

    /// Build a client of the same kind pointed at another host
    fn with_host(&self, host: &str) -> Result<Arc<dyn LlmBackend>, LlmError>;
}
