//! Request routing and the endpoint handlers

use chrono::Utc;
use entity_core::{
    ChatEvent, EngineError, FinishReason, ToolLoop, ToolResultPayload, WaitId,
    register_frontend_tools, sanitize_error,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use llm::{
    ChatMessage, ChatModel, ChatPayload, ChatRequest, GenerationOptions, Role, TokenUsage,
    ToolRegistry,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::response::{
    ApiError, Body, event_stream, json_response, method_not_allowed, not_found, preflight,
};
use crate::tools::register_server_tools;

/// Dispatch one request; never fails, errors become JSON error responses
pub async fn handle(state: Arc<AppState>, req: Request<Incoming>) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight();
    }

    let path = req.uri().path().to_string();
    let Some(route) = state.route_path(&path) else {
        return not_found(&path);
    };
    let route = route.to_string();

    debug!(method = %req.method(), path = %path, "Handling request");
    let known = matches!(
        route.as_str(),
        "/chat" | "/completion" | "/object" | "/embeddings" | "/frontend-tool-result" | "/health"
    );
    if !known {
        return not_found(&path);
    }

    let result = match (req.method().clone(), route.as_str()) {
        (Method::GET, "/health") => health(&state).await,
        (Method::POST, "/chat") => chat(&state, req).await,
        (Method::POST, "/completion") => completion(&state, req).await,
        (Method::POST, "/object") => object(&state, req).await,
        (Method::POST, "/embeddings") => embeddings(&state, req).await,
        (Method::POST, "/frontend-tool-result") => frontend_tool_result(&state, req).await,
        _ => return method_not_allowed(),
    };
    result.unwrap_or_else(ApiError::into_response)
}

async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
    limit: usize,
) -> Result<T, ApiError> {
    let bytes = Limited::new(req.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                ApiError::PayloadTooLarge(limit)
            } else {
                ApiError::BadRequest(format!("failed to read request body: {}", e))
            }
        })?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))
}

/// Message as sent by chat clients: plain text or a list of text parts
#[derive(Debug, Deserialize)]
struct WireMessage {
    role: Role,
    content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
}

impl From<WireMessage> for ChatMessage {
    fn from(msg: WireMessage) -> Self {
        let text = match msg.content {
            WireContent::Text(text) => text,
            WireContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join(""),
        };
        ChatMessage::new(msg.role, ChatPayload::text(text))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    messages: Vec<WireMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    max_steps: Option<usize>,
    #[serde(default = "default_true")]
    tools: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionBody {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    messages: Option<Vec<WireMessage>>,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsBody {
    input: EmbeddingInput,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    dimensions: Option<u32>,
}

fn with_system(system: Option<String>, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    match system {
        Some(system) if !system.is_empty() => {
            std::iter::once(ChatMessage::system(system)).chain(messages).collect()
        }
        _ => messages,
    }
}

fn send_error(events: &UnboundedSender<ChatEvent>, raw: &str) {
    warn!("Streaming request failed: {}", raw);
    let sanitized = sanitize_error(raw);
    let _ = events.send(ChatEvent::Error {
        message: sanitized.message,
        category: sanitized.category,
    });
}

async fn health(state: &AppState) -> Result<Response<Body>, ApiError> {
    let mut providers = serde_json::Map::new();
    for name in state.registry.provider_names() {
        let health = state.registry.health(&name).await;
        providers.insert(name, serde_json::to_value(health).unwrap_or(Value::Null));
    }
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "pendingToolCalls": state.pending.len(),
            "providers": providers,
        }),
    ))
}

async fn chat(state: &AppState, req: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: ChatBody = read_json(req, state.settings.server.max_body_bytes).await?;
    if body.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }

    let model = state.model_chain(body.model.as_deref())?;
    let options = GenerationOptions {
        temperature: body.temperature,
        max_tokens: body.max_tokens,
    };
    let messages = with_system(
        body.system,
        body.messages.into_iter().map(ChatMessage::from).collect(),
    );
    // Clients may lower the step bound but never raise it
    let max_steps = body
        .max_steps
        .map_or(state.settings.ai.max_steps, |n| n.min(state.settings.ai.max_steps));

    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = ToolRegistry::new();
    if body.tools {
        register_server_tools(&mut registry, state.data_source.clone());
        register_frontend_tools(
            &mut registry,
            state.pending.clone(),
            tx.clone(),
            state.tool_timeout(),
        );
    }
    info!(
        model = %model.name(),
        tools = registry.len(),
        max_steps,
        "Starting chat"
    );

    let tool_loop = ToolLoop::new(Arc::new(registry), max_steps);
    tokio::spawn(async move {
        match tool_loop.run(model, messages, options, &tx).await {
            Ok(_) => {}
            Err(EngineError::StreamClosed) => debug!("Chat client disconnected"),
            Err(e) => send_error(&tx, &e.to_string()),
        }
    });
    Ok(event_stream(rx))
}

/// Stream a model's answer as text-delta events; returns the full text and
/// whatever usage the provider reported
async fn stream_text(
    model: &Arc<dyn ChatModel + Send + Sync>,
    request: &ChatRequest,
    events: &UnboundedSender<ChatEvent>,
) -> anyhow::Result<(String, TokenUsage)> {
    let mut stream = model.stream_chat(request).await?;
    let mut text = String::new();
    let mut usage = TokenUsage::default();
    while let Some(chunk) = stream.next().await {
        if let Some(reported) = chunk.usage {
            usage = reported;
        }
        let delta = chunk.get_text();
        if delta.is_empty() {
            continue;
        }
        text.push_str(&delta);
        if events.send(ChatEvent::TextDelta { text: delta }).is_err() {
            anyhow::bail!("client disconnected");
        }
    }
    Ok((text, usage))
}

async fn completion(state: &AppState, req: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: CompletionBody = read_json(req, state.settings.server.max_body_bytes).await?;
    let model = state.model_chain(body.model.as_deref())?;
    let messages = with_system(body.system, vec![ChatMessage::user(body.prompt)]);
    let request = ChatRequest::new(messages.iter()).with_options(GenerationOptions {
        temperature: body.temperature,
        max_tokens: body.max_tokens,
    });

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        match stream_text(&model, &request, &tx).await {
            Ok((_, usage)) => {
                let _ = tx.send(ChatEvent::Finish {
                    finish_reason: FinishReason::Stop,
                    usage,
                });
            }
            Err(e) => send_error(&tx, &e.to_string()),
        }
    });
    Ok(event_stream(rx))
}

fn object_instructions(schema: Option<&Value>) -> String {
    let mut text =
        "Respond with a single JSON value and nothing else. Do not wrap it in prose.".to_string();
    if let Some(schema) = schema {
        text.push_str("\nThe value must match this JSON schema:\n");
        text.push_str(&schema.to_string());
    }
    text
}

/// Parse a model's JSON answer, tolerating a surrounding code fence
pub fn parse_object(text: &str) -> serde_json::Result<Value> {
    let trimmed = text.trim();
    let unfenced = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    };
    serde_json::from_str(unfenced)
}

async fn object(state: &AppState, req: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: ObjectBody = read_json(req, state.settings.server.max_body_bytes).await?;
    let mut messages: Vec<ChatMessage> = body
        .messages
        .unwrap_or_default()
        .into_iter()
        .map(ChatMessage::from)
        .collect();
    if let Some(prompt) = body.prompt {
        messages.push(ChatMessage::user(prompt));
    }
    if messages.is_empty() {
        return Err(ApiError::BadRequest(
            "either prompt or messages is required".to_string(),
        ));
    }

    let model = state.model_chain(body.model.as_deref())?;
    let mut system = object_instructions(body.schema.as_ref());
    if let Some(extra) = body.system {
        system = format!("{}\n\n{}", extra, system);
    }
    let messages = with_system(Some(system), messages);
    let request = ChatRequest::new(messages.iter()).with_options(GenerationOptions {
        temperature: body.temperature,
        max_tokens: body.max_tokens,
    });

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (text, usage) = match stream_text(&model, &request, &tx).await {
            Ok(streamed) => streamed,
            Err(e) => return send_error(&tx, &e.to_string()),
        };
        match parse_object(&text) {
            Ok(object) => {
                let _ = tx.send(ChatEvent::Object { object });
                let _ = tx.send(ChatEvent::Finish {
                    finish_reason: FinishReason::Stop,
                    usage,
                });
            }
            Err(e) => send_error(&tx, &format!("model did not return valid JSON: {}", e)),
        }
    });
    Ok(event_stream(rx))
}

async fn embeddings(state: &AppState, req: Request<Incoming>) -> Result<Response<Body>, ApiError> {
    let body: EmbeddingsBody = read_json(req, state.settings.server.max_body_bytes).await?;
    let inputs = match body.input {
        EmbeddingInput::One(text) => vec![text],
        EmbeddingInput::Many(texts) => texts,
    };
    if inputs.is_empty() {
        return Err(ApiError::BadRequest("input must not be empty".to_string()));
    }

    let model = state
        .registry
        .get_embedding_model(body.model.as_deref())
        .ok_or_else(|| {
            ApiError::ModelUnavailable(body.model.clone().unwrap_or_else(|| "<default>".into()))
        })?;
    let response = model.embed(&inputs, body.dimensions).await?;

    let data: Vec<Value> = response
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            json!({ "object": "embedding", "embedding": embedding, "index": index })
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "object": "list",
            "data": data,
            "model": model.name(),
            "usage": {
                "prompt_tokens": response.prompt_tokens,
                "total_tokens": response.prompt_tokens,
            },
        }),
    ))
}

async fn frontend_tool_result(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Body>, ApiError> {
    let body: Value = read_json(req, state.settings.server.max_body_bytes).await?;
    let Some(wait_id) = body.get("waitId").and_then(Value::as_str) else {
        return Err(ApiError::BadRequest("waitId is required".to_string()));
    };
    let wait_id = WaitId::from(wait_id.to_string());
    let payload: ToolResultPayload = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid tool result: {}", e)))?;

    if payload.deliver(&state.pending) {
        debug!(wait_id = %wait_id, "Delivered frontend tool result");
    } else {
        debug!(wait_id = %wait_id, "No pending tool call for result");
    }
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "waitId": wait_id,
            "timestamp": Utc::now().timestamp_millis(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_strips_fences() {
        let fenced = "```json\n{\"name\": \"lamp\"}\n```";
        assert_eq!(parse_object(fenced).unwrap(), json!({"name": "lamp"}));
        assert_eq!(parse_object(" [1, 2] ").unwrap(), json!([1, 2]));
        assert!(parse_object("here you go: {}").is_err());
    }

    #[test]
    fn test_wire_message_parts_are_joined() {
        let msg: WireMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "there"}]
        }))
        .unwrap();
        let msg = ChatMessage::from(msg);
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.get_text(), "hello there");
    }

    #[test]
    fn test_chat_body_defaults_tools_on() {
        let body: ChatBody = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert!(body.tools);
        assert!(body.model.is_none());
    }

    #[test]
    fn test_system_prompt_is_prepended() {
        let messages = with_system(Some("be brief".to_string()), vec![ChatMessage::user("hi")]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(with_system(None, vec![ChatMessage::user("hi")]).len(), 1);
    }
}
