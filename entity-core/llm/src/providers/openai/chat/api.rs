use crate::api::{ChatMessage, ChatPayload, ChatRequest, Role, TokenUsage};
use serde::{Deserialize, Serialize};

/// OpenAI roles; `tool` carries tool results and has no counterpart in `Role`
#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIRole {
    System,
    User,
    Assistant,
    Tool,
}

impl From<Role> for OpenAIRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => OpenAIRole::System,
            Role::User => OpenAIRole::User,
            Role::Assistant => OpenAIRole::Assistant,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Message {
    pub role: OpenAIRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Expand one chat message into OpenAI messages.
///
/// Every tool result becomes its own `tool` message; remaining text and tool
/// calls stay on a message with the original role.
pub fn to_messages(msg: &ChatMessage) -> Vec<Message> {
    let mut messages: Vec<Message> = msg
        .get_tool_results()
        .into_iter()
        .map(|result| Message {
            role: OpenAIRole::Tool,
            content: Some(result.content.clone()),
            tool_calls: None,
            tool_call_id: Some(result.tool_call_id.clone()),
        })
        .collect();

    let tool_calls: Vec<_> = msg
        .get_tool_calls()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: tc.name.clone(),
                arguments: tc.arguments.to_string(),
            },
        })
        .collect();
    let text = msg.get_text();

    if !text.is_empty() || !tool_calls.is_empty() {
        messages.push(Message {
            role: msg.role.into(),
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        });
    }
    messages
}

impl From<Message> for ChatMessage {
    fn from(msg: Message) -> Self {
        let role = match msg.role {
            OpenAIRole::System => Role::System,
            OpenAIRole::User | OpenAIRole::Tool => Role::User,
            OpenAIRole::Assistant => Role::Assistant,
        };
        let tool_calls = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| crate::api::ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(tc.function.arguments),
            })
            .collect();
        ChatMessage::new(
            role,
            ChatPayload::with_tool_calls(msg.content.unwrap_or_default(), tool_calls),
        )
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

impl ChatCompletionRequest {
    pub fn from_request(model: String, request: &ChatRequest, stream: bool) -> Self {
        let tools = request.tools().map(|tools| {
            tools
                .iter()
                .map(|t| Tool {
                    r#type: "function".to_string(),
                    function: FunctionDefinition {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: serde_json::to_value(&t.input_schema)
                            .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
                    },
                })
                .collect()
        });

        ChatCompletionRequest {
            model,
            messages: request.messages().iter().flat_map(to_messages).collect(),
            tools,
            temperature: request.options().temperature,
            max_tokens: request.options().max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

impl TryFrom<ChatCompletionResponse> for ChatMessage {
    type Error = anyhow::Error;

    fn try_from(response: ChatCompletionResponse) -> anyhow::Result<Self> {
        let usage = response.usage;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("OpenAI response contained no choices"))?;
        let message = ChatMessage::from(choice.message);
        Ok(match usage {
            Some(usage) => message.with_usage(usage.into()),
            None => message,
        })
    }
}

fn parse_arguments(arguments: String) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(&arguments).unwrap_or(serde_json::Value::String(arguments))
}

#[derive(Clone, Debug, Deserialize)]
pub struct Delta {
    pub role: Option<OpenAIRole>,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// A fragment of a streamed tool call; fragments sharing `index` concatenate
#[derive(Clone, Debug, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: Delta,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Reassembles streamed tool-call fragments by index
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    calls: std::collections::BTreeMap<usize, ToolCall>,
}

impl ToolCallBuffer {
    pub fn push(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let call = self.calls.entry(delta.index).or_insert_with(|| ToolCall {
                id: String::new(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: String::new(),
                    arguments: String::new(),
                },
            });
            if let Some(id) = delta.id {
                call.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.function.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.function.arguments.push_str(&arguments);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain the buffer into completed calls, in index order
    pub fn take(&mut self) -> Vec<crate::api::ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|tc| crate::api::ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(tc.function.arguments),
            })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

impl From<ModelEntry> for crate::ModelDefinition {
    fn from(model: ModelEntry) -> Self {
        let capability = if model.id.contains("embedding") {
            crate::ModelCapability::Embedding
        } else {
            crate::ModelCapability::Text
        };
        crate::ModelDefinition::new(model.id, vec![capability])
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListModelsResponse {
    pub data: Vec<ModelEntry>,
}
