//! End-to-end tests: real server on a random port, mock model provider

use async_trait::async_trait;
use engine_config::EngineSettings;
use entity_core::bridge::FieldInfo;
use entity_core::{
    BridgeHandle, ChatEvent, EntityModel, FieldDefinition, FieldType, FrontendToolExecutor,
    FrontendToolInterceptor, ToolResultClient, ValidationReport, Values, ViewController,
};
use entity_server::{AppState, ServerHandle, start_server};
use llm::{
    ChatChunk, ChatMessage, ChatModel, ChatPayload, ChatRequest, ChatStream, EmbeddingModel,
    EmbeddingResponse, ModelDefinition, ModelProvider, ProviderRegistry, Role, TokenUsage,
    ToolCall,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Behavior is picked by model name:
/// - `echo` repeats the last user message
/// - `form` asks the browser to set the `name` field, then reports the outcome
/// - `json` answers with a fenced JSON object
/// - `loop` asks for the current time forever
/// - `broken` always fails
struct MockModel {
    name: String,
}

impl MockModel {
    fn answer(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        let last = request
            .messages()
            .last()
            .ok_or_else(|| anyhow::anyhow!("empty request"))?;
        match self.name.as_str() {
            "echo" => Ok(ChatMessage::assistant(format!("echo: {}", last.get_text()))),
            "form" => {
                if let Some(result) = last.get_tool_results().first() {
                    return Ok(ChatMessage::assistant(format!("done: {}", result.content))
                        .with_usage(TokenUsage {
                            prompt_tokens: 20,
                            completion_tokens: 2,
                        }));
                }
                Ok(ChatMessage::assistant(ChatPayload::with_tool_calls(
                    String::new(),
                    vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "recordSetValues".to_string(),
                        arguments: json!({"values": {"name": "lamp"}}),
                    }],
                ))
                .with_usage(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }))
            }
            "json" => Ok(ChatMessage::assistant(
                "```json\n{\"name\": \"lamp\", \"stock\": 3}\n```",
            )),
            "loop" => Ok(ChatMessage::assistant(ChatPayload::with_tool_calls(
                "checking".to_string(),
                vec![ToolCall {
                    id: format!("call_{}", request.messages().len()),
                    name: "currentTime".to_string(),
                    arguments: json!({}),
                }],
            ))),
            _ => anyhow::bail!("upstream exploded"),
        }
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        self.answer(request)
    }

    /// Text a word per chunk, then one chunk with tool calls and usage
    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        let answer = self.answer(request)?;
        let mut chunks: Vec<ChatChunk> = answer
            .get_text()
            .split_inclusive(' ')
            .map(|word| ChatChunk::assistant(word.to_string()))
            .collect();
        let calls = answer.get_tool_calls().into_iter().cloned().collect();
        let last = ChatChunk::new(
            Role::Assistant,
            ChatPayload::with_tool_calls(String::new(), calls),
        );
        chunks.push(match answer.usage {
            Some(usage) => last.with_usage(usage),
            None => last,
        });
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

struct MockEmbedder;

#[async_trait]
impl EmbeddingModel for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embed"
    }

    async fn embed(
        &self,
        inputs: &[String],
        dimensions: Option<u32>,
    ) -> anyhow::Result<EmbeddingResponse> {
        let size = dimensions.unwrap_or(3) as usize;
        Ok(EmbeddingResponse {
            embeddings: inputs
                .iter()
                .map(|input| vec![input.len() as f32; size])
                .collect(),
            prompt_tokens: inputs.len() as u64,
        })
    }
}

struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>> {
        Ok(vec![ModelDefinition::text_model("echo")])
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(MockModel {
            name: model_name.to_string(),
        }))
    }

    fn create_embedding_model(
        &self,
        _model_name: &str,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        Some(Arc::new(MockEmbedder))
    }
}

async fn start(configure: impl FnOnce(&mut EngineSettings)) -> ServerHandle {
    let mut registry = ProviderRegistry::new();
    registry.register_provider("mock", Arc::new(MockProvider), Some("echo".to_string()));
    registry.set_default_model("mock");

    let mut settings = EngineSettings::default();
    settings.ai.tool_timeout_secs = 5;
    configure(&mut settings);

    start_server(AppState::new(Arc::new(registry), settings))
        .await
        .unwrap()
}

/// Complete JSON frames of an event-stream body; a trailing partial frame is skipped
fn frames(body: &str) -> Vec<Value> {
    let mut parts: Vec<&str> = body.split("\n\n").collect();
    parts.pop();
    parts
        .into_iter()
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .collect()
}

fn types(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

fn streamed_text(events: &[Value]) -> String {
    events
        .iter()
        .filter(|e| e["type"] == "text-delta")
        .map(|e| e["text"].as_str().unwrap())
        .collect()
}

/// Browser-side form with a single `name` field
struct NameForm {
    model: EntityModel,
    values: AsyncMutex<Values>,
}

impl NameForm {
    fn new() -> Arc<Self> {
        Arc::new(NameForm {
            model: EntityModel::new(
                "product",
                vec![FieldDefinition::new("name", FieldType::String)],
            ),
            values: AsyncMutex::new(Values::new()),
        })
    }
}

#[async_trait]
impl ViewController for NameForm {
    async fn field_info(&self) -> Vec<FieldInfo> {
        self.model.fields.iter().map(FieldInfo::from).collect()
    }

    async fn get_values(&self) -> Values {
        self.values.lock().await.clone()
    }

    async fn set_values(&self, values: Values) {
        self.values.lock().await.extend(values);
    }

    async fn reset(&self) {
        self.values.lock().await.clear();
    }

    async fn validate(&self) -> ValidationReport {
        let values = self.values.lock().await.clone();
        self.model.validate(&values)
    }
}

#[tokio::test]
async fn test_completion_streams_text_then_finish() {
    let handle = start(|_| {}).await;
    let response = reqwest::Client::new()
        .post(format!("{}/completion", handle.url()))
        .json(&json!({"prompt": "hello world"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let events = frames(&response.text().await.unwrap());
    assert_eq!(types(&events).last(), Some(&"finish"));
    let text: String = events
        .iter()
        .filter(|e| e["type"] == "text-delta")
        .map(|e| e["text"].as_str().unwrap())
        .collect();
    assert_eq!(text, "echo: hello world");
    handle.stop();
}

#[tokio::test]
async fn test_chat_round_trips_a_frontend_tool() {
    let handle = start(|_| {}).await;
    let client = reqwest::Client::new();
    let mut response = client
        .post(format!("{}/chat", handle.url()))
        .json(&json!({
            "model": "mock:form",
            "messages": [{"role": "user", "content": "name it lamp"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut buffer = String::new();
    let mut answered = false;
    while let Some(chunk) = response.chunk().await.unwrap() {
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        if answered {
            continue;
        }
        let request = frames(&buffer)
            .into_iter()
            .find(|e| e["type"] == "frontend-tool-request");
        if let Some(request) = request {
            assert_eq!(request["toolName"], "recordSetValues");
            assert_eq!(request["input"], json!({"values": {"name": "lamp"}}));
            let wait_id = request["waitId"].as_str().unwrap();
            assert!(wait_id.starts_with("recordSetValues-"));

            let ack: Value = client
                .post(format!("{}/frontend-tool-result", handle.url()))
                .json(&json!({
                    "waitId": wait_id,
                    "result": {"success": true, "appliedFields": ["name"]},
                    "timestamp": 0
                }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(ack["success"], true);
            assert_eq!(ack["waitId"], wait_id);
            answered = true;
        }
    }
    assert!(answered);

    let events = frames(&buffer);
    let kinds = types(&events);
    assert_eq!(
        kinds[..4],
        ["tool-call", "frontend-tool-request", "tool-result", "step-finish"]
    );
    assert_eq!(kinds[kinds.len() - 2..], ["step-finish", "finish"]);
    let deltas = kinds.iter().filter(|k| **k == "text-delta").count();
    assert!(deltas > 1, "answer arrived in {} delta(s)", deltas);
    assert_eq!(deltas, kinds.len() - 6);

    let finish = events.last().unwrap();
    assert_eq!(finish["finishReason"], "stop");
    assert_eq!(finish["usage"]["prompt_tokens"], 30);
    let text = streamed_text(&events);
    assert!(text.starts_with("done: "));
    assert!(text.contains("appliedFields"));
    handle.stop();
}

#[tokio::test]
async fn test_interceptor_answers_frontend_tools_over_http() {
    let handle = start(|_| {}).await;
    let bridge = BridgeHandle::new();
    let form = NameForm::new();
    let _guard = bridge.mount(form.clone());
    let interceptor = FrontendToolInterceptor::new(
        FrontendToolExecutor::new(bridge),
        ToolResultClient::new(format!("{}/frontend-tool-result", handle.url())),
    );

    let mut response = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .json(&json!({
            "model": "mock:form",
            "messages": [{"role": "user", "content": "name it lamp"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut buffer = String::new();
    let mut seen = 0;
    let mut handled = 0;
    while let Some(chunk) = response.chunk().await.unwrap() {
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        let events = frames(&buffer);
        for frame in &events[seen..] {
            let event: ChatEvent = serde_json::from_value(frame.clone()).unwrap();
            if interceptor.handle(&event).await.unwrap() {
                handled += 1;
            }
        }
        seen = events.len();
    }

    assert_eq!(handled, 1);
    assert_eq!(form.values.lock().await.get("name"), Some(&json!("lamp")));

    let events = frames(&buffer);
    let finish = events.last().unwrap();
    assert_eq!(finish["type"], "finish");
    assert_eq!(finish["finishReason"], "stop");
    assert!(streamed_text(&events).contains(r#""appliedFields":["name"]"#));
    handle.stop();
}

#[tokio::test]
async fn test_chat_step_bound_cannot_be_raised_by_client() {
    let handle = start(|settings| settings.ai.max_steps = 2).await;
    let body = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .json(&json!({
            "model": "mock:loop",
            "maxSteps": 1000,
            "messages": [{"role": "user", "content": "what time is it"}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = frames(&body);
    let kinds = types(&events);
    assert_eq!(kinds.iter().filter(|k| **k == "step-finish").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "tool-result").count(), 2);
    let finish = events.last().unwrap();
    assert_eq!(finish["type"], "finish");
    assert_eq!(finish["finishReason"], "length");
    handle.stop();
}

#[tokio::test]
async fn test_chat_client_may_lower_step_bound() {
    let handle = start(|settings| settings.ai.max_steps = 4).await;
    let body = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .json(&json!({
            "model": "mock:loop",
            "maxSteps": 1,
            "messages": [{"role": "user", "content": "what time is it"}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = frames(&body);
    assert_eq!(types(&events).iter().filter(|k| **k == "step-finish").count(), 1);
    assert_eq!(events.last().unwrap()["finishReason"], "length");
    handle.stop();
}

#[tokio::test]
async fn test_chat_model_failure_is_streamed_sanitized() {
    let handle = start(|_| {}).await;
    let body = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .json(&json!({
            "model": "mock:broken",
            "tools": false,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = frames(&body);
    assert_eq!(types(&events), vec!["error"]);
    assert_eq!(events[0]["category"], "generic");
}

#[tokio::test]
async fn test_chat_without_providers_is_unavailable() {
    let handle = start_server(AppState::new(
        Arc::new(ProviderRegistry::new()),
        EngineSettings::default(),
    ))
    .await
    .unwrap();
    let response = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
    handle.stop();
}

#[tokio::test]
async fn test_object_parses_fenced_json() {
    let handle = start(|_| {}).await;
    let body = reqwest::Client::new()
        .post(format!("{}/object", handle.url()))
        .json(&json!({
            "model": "mock:json",
            "prompt": "describe a lamp",
            "schema": {"type": "object", "properties": {"name": {"type": "string"}}}
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = frames(&body);
    let object = events.iter().find(|e| e["type"] == "object").unwrap();
    assert_eq!(object["object"], json!({"name": "lamp", "stock": 3}));
    assert_eq!(types(&events).last(), Some(&"finish"));
}

#[tokio::test]
async fn test_object_requires_a_prompt() {
    let handle = start(|_| {}).await;
    let response = reqwest::Client::new()
        .post(format!("{}/object", handle.url()))
        .json(&json!({"model": "mock:json"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_embeddings_list_shape() {
    let handle = start(|_| {}).await;
    let body: Value = reqwest::Client::new()
        .post(format!("{}/embeddings", handle.url()))
        .json(&json!({"input": ["ab", "abcd"], "dimensions": 2}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "list");
    assert_eq!(body["model"], "mock-embed");
    assert_eq!(body["data"][1]["object"], "embedding");
    assert_eq!(body["data"][1]["index"], 1);
    assert_eq!(body["data"][1]["embedding"], json!([4.0, 4.0]));
    assert_eq!(body["usage"]["prompt_tokens"], 2);
    assert_eq!(body["usage"]["total_tokens"], 2);
}

#[tokio::test]
async fn test_frontend_tool_result_validation() {
    let handle = start(|_| {}).await;
    let client = reqwest::Client::new();
    let url = format!("{}/frontend-tool-result", handle.url());

    let unknown = client
        .post(&url)
        .json(&json!({"waitId": "recordGetValues-1-deadbeef", "result": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 200);
    let body: Value = unknown.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["timestamp"].is_i64());

    let missing = client
        .post(&url)
        .json(&json!({"result": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);
}

#[tokio::test]
async fn test_routing_cors_and_base_path() {
    let handle = start(|settings| settings.server.base_path = "/api/ee".to_string()).await;
    assert!(handle.url().ends_with("/api/ee"));
    let client = reqwest::Client::new();

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("{}/chat", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 200);
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
    assert!(
        preflight.headers()["access-control-allow-methods"]
            .to_str()
            .unwrap()
            .contains("POST")
    );

    let root = format!("http://127.0.0.1:{}", handle.port());
    let outside = client.post(format!("{}/chat", root)).send().await.unwrap();
    assert_eq!(outside.status(), 404);
    assert_eq!(outside.headers()["access-control-allow-origin"], "*");

    let unknown = client
        .post(format!("{}/nope", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let wrong_method = client
        .get(format!("{}/chat", handle.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_method.status(), 405);

    let health: Value = client
        .get(format!("{}/health", handle.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["providers"].get("mock").is_some());
    handle.stop();
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let handle = start(|_| {}).await;
    let response = reqwest::Client::new()
        .post(format!("{}/chat", handle.url()))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid request body"));
}
