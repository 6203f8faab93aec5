//! streamd - streaming coordination for local LLM generation
//!
//! streamd issues concurrent generation requests against an Ollama server,
//! tracks each stream's lifecycle, supports cooperative cancellation and
//! publishes every step as a typed event on a central bus that any number of
//! consumers can subscribe to independently.
//!
//! # Core Concepts
//!
//! - **One Writer**: The stream manager is the only thing that mutates stream state
//! - **Everything Is An Event**: started, chunk, completed, error and cancelled
//! - **Isolated Consumers**: A failing subscriber never affects the others
//! - **Exactly One Ending**: Every stream emits one terminal event and nothing after it
//!
//! # Modules
//!
//! - [`events`] - Event model, event bus, debug formatting and session log
//! - [`stream`] - Stream lifecycle manager
//! - [`llm`] - LLM backend trait and Ollama implementation
//! - [`compat`] - Request/response facade over the manager
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod compat;
pub mod config;
pub mod events;
pub mod llm;
pub mod stream;

pub use compat::SimpleClient;
pub use config::Config;
pub use events::{EventBus, EventFilter, EventType, StreamContext, StreamEvent};
pub use llm::{LlmBackend, LlmError, OllamaClient, create_client};
pub use stream::{ConnectionStatus, StreamInfo, StreamManager, StreamRequest};
