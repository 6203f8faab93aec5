//! Integration tests for streamd
//!
//! These drive the public API end to end against a mock Ollama server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use streamd::config::{OllamaConfig, SessionLogConfig};
use streamd::events::{EventBus, EventFilter, EventType, SessionLogger, StreamContext, StreamEvent, Subscription};
use streamd::llm::{GenerateRequest, LlmBackend, LlmError, OllamaClient, create_client};
use streamd::stream::{StreamManager, StreamRequest};
use streamd::SimpleClient;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

fn ollama_config(host: &str) -> OllamaConfig {
    OllamaConfig {
        host: host.to_string(),
        timeout_ms: 5000,
        max_retries: 0,
    }
}

fn manager_for(server: &MockServer) -> StreamManager {
    let backend = create_client(&ollama_config(&server.uri())).expect("client");
    StreamManager::new(backend, EventBus::new())
}

fn ndjson(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        body.push_str(&json!({"model": "llama3.2", "response": part, "done": false}).to_string());
        body.push('\n');
    }
    body.push_str(&json!({"model": "llama3.2", "response": "", "done": true}).to_string());
    body.push('\n');
    body
}

async fn mount_stream(server: &MockServer, parts: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson(parts), "application/x-ndjson"))
        .mount(server)
        .await;
}

fn record(bus: &EventBus, filter: EventFilter) -> (Subscription, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = bus.subscribe_with_filter(filter, move |event| {
        let _ = tx.send(event.clone());
        Ok(())
    });
    (sub, rx)
}

async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("bus closed");
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

fn stream_events(events: &[StreamEvent], stream_id: &str) -> Vec<EventType> {
    events
        .iter()
        .filter(|e| e.stream_id() == Some(stream_id))
        .map(StreamEvent::event_type)
        .collect()
}

// =============================================================================
// Stream lifecycle against Ollama
// =============================================================================

#[tokio::test]
async fn test_stream_end_to_end() {
    let server = MockServer::start().await;
    mount_stream(&server, &["He", "llo"]).await;

    let manager = manager_for(&server);
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    let id = manager.start_stream(StreamRequest::new("llama3.2", "say hello", StreamContext::UserChat));
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        stream_events(&events, &id),
        vec![
            EventType::StreamStarted,
            EventType::StreamChunk,
            EventType::StreamChunk,
            EventType::StreamCompleted
        ]
    );
    let chunks: Vec<(u64, String)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { chunk, .. } => Some((chunk.sequence, chunk.content.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![(0, "He".to_string()), (1, "llo".to_string())]);

    match events.last() {
        Some(StreamEvent::Completed { result }) => {
            assert_eq!(result.full_content, "Hello");
            let metrics = result.metrics.as_ref().expect("metrics");
            assert_eq!(metrics.total_chunks, 2);
            assert_eq!(metrics.total_bytes, 5);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(manager.get_stream_info(&id).is_none());
}

#[tokio::test]
async fn test_unknown_model_reports_stream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model 'nope' not found"})))
        .mount(&server)
        .await;

    let manager = manager_for(&server);
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    let id = manager.start_stream(StreamRequest::new("nope", "hi", StreamContext::ManualDebug));
    let events = until_terminal(&mut rx).await;

    assert_eq!(stream_events(&events, &id), vec![EventType::StreamStarted, EventType::StreamError]);
    match events.last() {
        Some(StreamEvent::Error { error, .. }) => {
            assert_eq!(error.code.as_deref(), Some("api_error"));
            assert!(error.message.contains("model 'nope' not found"));
            assert_eq!(error.details.as_ref().unwrap()["status"], 404);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_error_line_mid_stream() {
    let server = MockServer::start().await;
    let body = format!(
        "{}\n{}\n",
        json!({"response": "par", "done": false}),
        json!({"error": "model runner has unexpectedly stopped"})
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let manager = manager_for(&server);
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    let id = manager.start_stream(StreamRequest::new("llama3.2", "hi", StreamContext::UserChat));
    let events = until_terminal(&mut rx).await;
    assert_eq!(
        stream_events(&events, &id),
        vec![EventType::StreamStarted, EventType::StreamChunk, EventType::StreamError]
    );
}

#[tokio::test]
async fn test_cancel_while_waiting_for_first_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(ndjson(&["late"]), "application/x-ndjson")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let manager = manager_for(&server);
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    let id = manager.start_stream(StreamRequest::new("llama3.2", "hi", StreamContext::UserChat));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.cancel_stream(&id, Some("user abort")).await);

    let events = until_terminal(&mut rx).await;
    assert_eq!(stream_events(&events, &id), vec![EventType::StreamStarted, EventType::StreamCancelled]);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_filtered_subscribers_see_only_their_stream() {
    let server = MockServer::start().await;
    mount_stream(&server, &["a", "b", "c"]).await;

    let manager = manager_for(&server);
    let (_all, mut all_rx) = record(manager.bus(), EventFilter::default());
    let (_form_only, mut form_rx) = record(
        manager.bus(),
        EventFilter::for_context(StreamContext::FormAnalysis).with_types([EventType::StreamCompleted]),
    );

    let form = manager.start_stream(StreamRequest::new("llama3.2", "form", StreamContext::FormAnalysis));
    let chat = manager.start_stream(StreamRequest::new("llama3.2", "chat", StreamContext::UserChat));

    let mut events = until_terminal(&mut all_rx).await;
    events.extend(until_terminal(&mut all_rx).await);
    assert_eq!(stream_events(&events, &form).len(), 5);
    assert_eq!(stream_events(&events, &chat).len(), 5);

    let filtered = until_terminal(&mut form_rx).await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].stream_id(), Some(form.as_str()));
    assert!(form_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_update_host_routes_new_streams() {
    let old_server = MockServer::start().await;
    let new_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson(&["old"]), "application/x-ndjson"))
        .expect(1)
        .mount(&old_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson(&["new"]), "application/x-ndjson"))
        .expect(1)
        .mount(&new_server)
        .await;

    let manager = manager_for(&old_server);
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    manager.start_stream(StreamRequest::new("llama3.2", "one", StreamContext::SettingsTest));
    let first = until_terminal(&mut rx).await;

    manager.update_host(&new_server.uri()).expect("valid host");
    manager.start_stream(StreamRequest::new("llama3.2", "two", StreamContext::SettingsTest));
    let second = until_terminal(&mut rx).await;

    match (first.last(), second.last()) {
        (Some(StreamEvent::Completed { result: a }), Some(StreamEvent::Completed { result: b })) => {
            assert_eq!(a.full_content, "old");
            assert_eq!(b.full_content, "new");
        }
        other => panic!("unexpected {:?}", other),
    }

    assert!(matches!(manager.update_host("not a host"), Err(LlmError::InvalidHost { .. })));
    assert_eq!(manager.host(), new_server.uri());
}

// =============================================================================
// Connection and backend client
// =============================================================================

#[tokio::test]
async fn test_connection_lists_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "llama3.2:latest", "modified_at": "2025-01-01T00:00:00Z", "size": 2019393189,
                 "digest": "a80c4f17acd5", "details": {"family": "llama", "parameter_size": "3.2B"}},
                {"name": "qwen2.5:7b", "size": 4683087332u64, "digest": "845dbda0ea48"}
            ]
        })))
        .mount(&server)
        .await;

    let manager = manager_for(&server);
    let status = manager.test_connection().await;
    assert!(status.connected);
    assert_eq!(status.models, vec!["llama3.2:latest", "qwen2.5:7b"]);

    let client = OllamaClient::from_config(&ollama_config(&server.uri())).unwrap();
    let models = client.list_models().await.unwrap();
    assert_eq!(models[0].details.as_ref().unwrap().family.as_deref(), Some("llama"));
}

#[tokio::test]
async fn test_connection_failure_never_raises() {
    // Nothing listens on the discard port
    let backend = create_client(&ollama_config("http://127.0.0.1:9")).unwrap();
    let manager = StreamManager::new(backend, EventBus::new());

    let status = manager.test_connection().await;
    assert!(!status.connected);
    assert!(status.models.is_empty());
    assert!(status.error.is_some());
}

#[tokio::test]
async fn test_generate_retries_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": false, "model": "llama3.2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.2",
            "created_at": "2025-01-01T00:00:00Z",
            "response": "Hi there",
            "done": true
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::from_config(&OllamaConfig {
        max_retries: 1,
        ..ollama_config(&server.uri())
    })
    .unwrap();
    let response = client.generate(GenerateRequest::new("llama3.2", "hi")).await.unwrap();
    assert_eq!(response.response, "Hi there");
    assert!(response.done);
}

#[tokio::test]
async fn test_rate_limit_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::from_config(&OllamaConfig {
        max_retries: 3,
        ..ollama_config(&server.uri())
    })
    .unwrap();
    let err = client.generate(GenerateRequest::new("llama3.2", "hi")).await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

// =============================================================================
// Facade and session log
// =============================================================================

#[tokio::test]
async fn test_simple_client_over_ollama() {
    let server = MockServer::start().await;
    mount_stream(&server, &["He", "llo"]).await;

    let client = SimpleClient::new(manager_for(&server));
    let mut chunks = Vec::new();
    let text = client
        .generate_with_callback("llama3.2", "hi", |c| chunks.push(c.to_string()))
        .await
        .unwrap();
    assert_eq!(text, "Hello");
    assert_eq!(chunks, vec!["He", "llo"]);
}

#[tokio::test]
async fn test_session_log_export() {
    let server = MockServer::start().await;
    mount_stream(&server, &["x", "y"]).await;

    let manager = manager_for(&server);
    let logger = SessionLogger::new(SessionLogConfig::default());
    let _log = logger.attach(manager.bus());
    let (_sub, mut rx) = record(manager.bus(), EventFilter::default());

    let id = manager.start_stream(StreamRequest::new("llama3.2", "hi", StreamContext::FormAnalysis));
    until_terminal(&mut rx).await;

    assert_eq!(logger.by_stream(&id).len(), 4);
    assert_eq!(logger.by_context(StreamContext::FormAnalysis).len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("session.json");
    logger.export_to_file(&file).unwrap();

    let exported: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(exported["entries"].as_array().unwrap().len(), 4);
    assert!(exported["current_session"].is_object());
    assert!(exported["exported_at"].is_string());
}

#[tokio::test]
async fn test_backend_trait_object_is_shareable() {
    let server = MockServer::start().await;
    mount_stream(&server, &["a"]).await;

    let backend: Arc<dyn LlmBackend> = create_client(&ollama_config(&server.uri())).unwrap();
    let one = StreamManager::new(Arc::clone(&backend), EventBus::new());
    let two = StreamManager::new(backend, EventBus::new());
    assert_eq!(one.host(), two.host());
}
