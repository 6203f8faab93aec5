//! Ollama REST API client implementation
//!
//! Implements the LlmBackend trait over `/api/tags` and `/api/generate`.
//! Streaming responses are newline-delimited JSON objects, each carrying a
//! `response` fragment, with `done: true` on the last one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{GenerateRequest, GenerateResponse, LlmBackend, LlmError, ModelInfo, TextStream};
use crate::config::OllamaConfig;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Default `retry-after` when a 429 carries none
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Ollama API client
#[derive(Clone)]
pub struct OllamaClient {
    host: String,
    http: Client,
    max_retries: u32,
    timeout: Duration,
}

impl OllamaClient {
    /// Create a new client from configuration
    pub fn from_config(config: &OllamaConfig) -> Result<Self, LlmError> {
        debug!(?config, "from_config: called");
        let timeout = Duration::from_millis(config.timeout_ms);

        // No overall timeout on the client: a stream legitimately runs for as
        // long as the model keeps producing. Non-streaming calls set one per request.
        let http = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            host: normalize_host(&config.host)?,
            http,
            max_retries: config.max_retries,
            timeout,
        })
    }

    /// Build the JSON body for `/api/generate`
    fn build_request_body(&self, request: &GenerateRequest, stream: bool) -> serde_json::Value {
        debug!(model = %request.model, %stream, "build_request_body: called");
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": stream,
        });

        if let Some(options) = &request.options
            && !options.is_empty()
        {
            debug!("build_request_body: adding options");
            body["options"] = serde_json::json!(options);
        }

        body
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    /// Send a request, retrying transient failures with exponential backoff
    ///
    /// `build` is called once per attempt. Returns the first successful
    /// response. 429 fails immediately with the server's retry-after. When
    /// `retry_connect` is false a refused connection also fails immediately.
    async fn send_with_retry<F>(&self, op: &str, retry_connect: bool, build: F) -> Result<Response, LlmError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                warn!(%op, attempt, backoff_ms = backoff, "send_with_retry: retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let error = match build().send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%op, attempt, "send_with_retry: success");
                    return Ok(response);
                }
                Ok(response) => error_from_response(response).await,
                Err(e) => LlmError::Network(e),
            };
            debug!(%op, attempt, error = %error, "send_with_retry: attempt failed");

            if attempt >= self.max_retries || !error.is_retryable() || (!retry_connect && error.is_connect()) {
                return Err(error);
            }
            attempt += 1;
        }
    }
}

/// Map a non-success response to an error
async fn error_from_response(response: Response) -> LlmError {
    let status = response.status().as_u16();
    if status == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return LlmError::RateLimited {
            retry_after: Duration::from_secs(retry_after),
        };
    }

    let text = response.text().await.unwrap_or_default();
    LlmError::ApiError {
        status,
        message: api_error_message(&text),
    }
}

#[async_trait]
impl LlmBackend for OllamaClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        debug!(host = %self.host, "list_models: called");
        let url = self.url("/api/tags");
        let response = self
            .send_with_retry("list_models", false, || self.http.get(url.as_str()).timeout(self.timeout))
            .await?;

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        debug!(model_count = %tags.models.len(), "list_models: success");
        Ok(tags.models)
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        debug!(model = %request.model, "generate: called");
        let url = self.url("/api/generate");
        let body = self.build_request_body(&request, false);
        let response = self
            .send_with_retry("generate", true, || {
                self.http.post(url.as_str()).json(&body).timeout(self.timeout)
            })
            .await?;

        let text = response.text().await?;
        let line: GenerateLine = serde_json::from_str(&text)?;
        if let Some(error) = line.error {
            debug!(%error, "generate: backend reported error");
            return Err(LlmError::Backend(error));
        }
        Ok(GenerateResponse {
            model: line.model.unwrap_or(request.model),
            created_at: line.created_at.unwrap_or_default(),
            response: line.response,
            done: line.done,
        })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, LlmError> {
        debug!(model = %request.model, "generate_stream: called");
        let url = self.url("/api/generate");
        let body = self.build_request_body(&request, true);
        let response = self
            .send_with_retry("generate_stream", true, || self.http.post(url.as_str()).json(&body))
            .await?;

        debug!("generate_stream: response accepted, streaming body");
        Ok(ndjson_text_stream(response.bytes_stream()))
    }

    fn with_host(&self, host: &str) -> Result<Arc<dyn LlmBackend>, LlmError> {
        debug!(%host, "with_host: called");
        Ok(Arc::new(Self {
            host: normalize_host(host)?,
            ..self.clone()
        }))
    }
}

/// Validate a host URL and strip any trailing slash
pub fn normalize_host(host: &str) -> Result<String, LlmError> {
    let trimmed = host.trim().trim_end_matches('/');
    let invalid = |reason: &str| LlmError::InvalidHost {
        host: host.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host name"));
    }
    Ok(trimmed.to_string())
}

/// Turn a newline-delimited JSON body into a stream of text fragments
///
/// Lines are split on raw bytes so multi-byte characters cut across network
/// reads survive intact. Empty fragments are skipped; the stream ends after
/// the `done` line, on an `error` line, or when the body ends.
fn ndjson_text_stream<S, B>(body: S) -> TextStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = NdjsonState {
        body: body.boxed(),
        buffer: Vec::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match state.parse(&line) {
                    Some(item) => return Some((item, state)),
                    None => continue,
                }
            }

            match state.body.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    debug!(error = %e, "ndjson_text_stream: body error");
                    state.finished = true;
                    return Some((Err(LlmError::Network(e)), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    let item = state.parse(&rest);
                    state.finished = true;
                    return item.map(|item| (item, state));
                }
            }
        }
    })
    .boxed()
}

struct NdjsonState<B> {
    body: futures::stream::BoxStream<'static, Result<B, reqwest::Error>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl<B> NdjsonState<B> {
    /// Decode one line; `None` means nothing to yield for it
    fn parse(&mut self, line: &[u8]) -> Option<Result<String, LlmError>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }

        let parsed: GenerateLine = match serde_json::from_slice(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "NdjsonState::parse: malformed line");
                self.finished = true;
                return Some(Err(LlmError::Json(e)));
            }
        };

        if let Some(error) = parsed.error {
            debug!(%error, "NdjsonState::parse: backend reported error");
            self.finished = true;
            return Some(Err(LlmError::Backend(error)));
        }
        if parsed.done {
            self.finished = true;
        }
        if parsed.response.is_empty() {
            None
        } else {
            Some(Ok(parsed.response))
        }
    }
}

/// One `/api/generate` object, streamed or not
#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Ollama reports failures as `{"error": "..."}`; fall back to the raw body
fn api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerateOptions;

    fn config() -> OllamaConfig {
        OllamaConfig {
            host: "http://localhost:11434/".to_string(),
            timeout_ms: 5000,
            max_retries: 0,
        }
    }

    async fn collect(parts: Vec<&'static [u8]>) -> Vec<Result<String, LlmError>> {
        let body = futures::stream::iter(parts.into_iter().map(Ok::<_, reqwest::Error>));
        ndjson_text_stream(body).collect().await
    }

    #[test]
    fn test_from_config_trims_host() {
        let client = OllamaClient::from_config(&config()).unwrap();
        assert_eq!(client.host(), "http://localhost:11434");
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_normalize_host_rejects_bad_hosts() {
        assert!(matches!(normalize_host("localhost:11434"), Err(LlmError::InvalidHost { .. })));
        assert!(matches!(normalize_host("ftp://example.com"), Err(LlmError::InvalidHost { .. })));
        assert!(matches!(normalize_host(""), Err(LlmError::InvalidHost { .. })));
        assert_eq!(normalize_host(" https://gpu.lan:8080// ").unwrap(), "https://gpu.lan:8080");
    }

    #[test]
    fn test_build_request_body() {
        let client = OllamaClient::from_config(&config()).unwrap();
        let body = client.build_request_body(&GenerateRequest::new("llama3.2", "hi"), true);
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["prompt"], "hi");
        assert_eq!(body["stream"], true);
        assert!(body.get("options").is_none());

        let request = GenerateRequest::new("llama3.2", "hi").with_options(GenerateOptions {
            temperature: Some(0.5),
            ..Default::default()
        });
        let body = client.build_request_body(&request, false);
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0.5);
        assert!(body["options"].get("stop").is_none());
    }

    #[test]
    fn test_with_host_validates() {
        let client = OllamaClient::from_config(&config()).unwrap();
        let moved = client.with_host("http://gpu.lan:11434/").unwrap();
        assert_eq!(moved.host(), "http://gpu.lan:11434");
        assert!(client.with_host("not a url").is_err());
        assert_eq!(client.host(), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_ndjson_fragments_in_order() {
        let items = collect(vec![
            &b"{\"response\":\"He\",\"done\":false}\n{\"response\":\"\",\"done\":false}\n"[..],
            &b"{\"response\":\"llo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n"[..],
        ])
        .await;
        let parts: Vec<String> = items.into_iter().map(|p| p.unwrap()).collect();
        assert_eq!(parts, vec!["He", "llo"]);
    }

    #[tokio::test]
    async fn test_ndjson_lines_split_across_reads() {
        // "é" is two bytes; split it between reads
        let items = collect(vec![&b"{\"response\":\"caf\xc3"[..], &b"\xa9\"}\n{\"done\":true}"[..]]).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "café");
    }

    #[tokio::test]
    async fn test_ndjson_stops_after_done() {
        let items = collect(vec![&b"{\"response\":\"a\",\"done\":true}\n{\"response\":\"late\"}\n"[..]]).await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_ndjson_error_line_ends_stream() {
        let items = collect(vec![
            &b"{\"response\":\"a\"}\n{\"error\":\"model runner crashed\"}\n{\"response\":\"b\"}\n"[..],
        ])
        .await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(LlmError::Backend(msg)) => assert_eq!(msg, "model runner crashed"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ndjson_malformed_line() {
        let items = collect(vec![&b"not json\n"[..]]).await;
        assert!(matches!(items.as_slice(), [Err(LlmError::Json(_))]));
    }

    #[test]
    fn test_api_error_message() {
        assert_eq!(api_error_message("{\"error\":\"model 'x' not found\"}"), "model 'x' not found");
        assert_eq!(api_error_message("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_list_models_fails_fast_when_refused() {
        let client = OllamaClient::from_config(&OllamaConfig {
            host: "http://127.0.0.1:9".to_string(),
            max_retries: 3,
            ..config()
        })
        .unwrap();

        // Retrying would back off for 1s + 2s + 4s
        let result = tokio::time::timeout(Duration::from_secs(2), client.list_models())
            .await
            .expect("refused connection should not be retried");
        let err = result.unwrap_err();
        assert!(err.is_connect());
        assert_eq!(err.code(), "connection_failed");
    }
}
