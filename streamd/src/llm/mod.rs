//! LLM backend module for streamd
//!
//! A minimal client surface over a local Ollama server: list models, one-shot
//! generation, and incremental (streamed) generation.

use std::sync::Arc;

use tracing::debug;

pub mod client;
mod error;
mod ollama;
mod types;

pub use client::LlmBackend;
pub use error::LlmError;
pub use ollama::{OllamaClient, normalize_host};
pub use types::{GenerateOptions, GenerateRequest, GenerateResponse, ModelDetails, ModelInfo, TextStream};

use crate::config::OllamaConfig;

/// Create the backend client described by config
pub fn create_client(config: &OllamaConfig) -> Result<Arc<dyn LlmBackend>, LlmError> {
    debug!(host = %config.host, "create_client: called");
    Ok(Arc::new(OllamaClient::from_config(config)?))
}
