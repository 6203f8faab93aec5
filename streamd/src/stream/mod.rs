//! Stream lifecycle management
//!
//! Each stream moves forward through
//! `starting -> streaming -> completed | error | cancelled` and is removed
//! from the registry the moment it reaches a terminal state.

mod manager;
mod metrics;

pub use manager::{ConnectionStatus, MANAGER_SOURCE, StreamInfo, StreamManager, StreamRequest, stream_error};
pub use metrics::{CHARS_PER_TOKEN, compute_metrics, tokens_per_second};
