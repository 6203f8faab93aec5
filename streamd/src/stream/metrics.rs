//! Stream performance metrics

use std::time::Duration;

use crate::events::StreamMetrics;

/// Characters per token used for the throughput estimate
pub const CHARS_PER_TOKEN: f64 = 4.0;

/// Summarize a finished stream
pub fn compute_metrics(total_chunks: usize, content: &str, elapsed: Duration) -> StreamMetrics {
    let duration_ms = elapsed.as_millis() as u64;
    StreamMetrics {
        total_chunks: total_chunks as u64,
        total_bytes: content.len() as u64,
        duration_ms,
        tokens_per_second: tokens_per_second(content.chars().count(), duration_ms),
    }
}

/// Estimated tokens per second; zero for an instantaneous stream
pub fn tokens_per_second(chars: usize, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    (chars as f64 / CHARS_PER_TOKEN) / (duration_ms as f64 / 1000.0)
}
