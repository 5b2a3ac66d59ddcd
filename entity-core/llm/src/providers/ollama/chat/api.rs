use crate::api::{ChatMessage, ChatPayload, ChatRequest, Role, TokenUsage, ToolCall as ApiToolCall};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ModelDetails {
    pub(crate) families: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ModelDefinition {
    pub(crate) name: String,
    pub(crate) details: Option<ModelDetails>,
}

impl From<ModelDefinition> for crate::ModelDefinition {
    fn from(model: ModelDefinition) -> Self {
        // Embedding-only models report a single family that mentions "embed"
        let is_embedding = model
            .details
            .as_ref()
            .and_then(|d| d.families.as_ref())
            .is_some_and(|families| {
                families.len() == 1 && families[0].to_lowercase().contains("embed")
            })
            || model.name.contains("embed");

        let capability = if is_embedding {
            crate::ModelCapability::Embedding
        } else {
            crate::ModelCapability::Text
        };
        crate::ModelDefinition::new(model.name, vec![capability])
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ListModelsResponse {
    pub(crate) models: Vec<ModelDefinition>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct FunctionCall {
    pub(crate) name: String,
    pub(crate) arguments: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ToolCall {
    pub(crate) function: FunctionCall,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Message {
    pub(crate) role: String,
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tool_calls: Vec<ToolCall>,
}

/// Ollama has no tool-call ids; results go back as `tool` messages in call order.
pub(crate) fn to_messages(msg: &ChatMessage) -> Vec<Message> {
    let mut messages: Vec<Message> = msg
        .get_tool_results()
        .into_iter()
        .map(|result| Message {
            role: "tool".to_string(),
            content: result.content.clone(),
            tool_calls: Vec::new(),
        })
        .collect();

    let tool_calls: Vec<ToolCall> = msg
        .get_tool_calls()
        .into_iter()
        .map(|tc| ToolCall {
            function: FunctionCall {
                name: tc.name.clone(),
                arguments: tc.arguments.clone(),
            },
        })
        .collect();
    let text = msg.get_text();

    if !text.is_empty() || !tool_calls.is_empty() {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        messages.push(Message {
            role: role.to_string(),
            content: text,
            tool_calls,
        });
    }
    messages
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) num_predict: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct Tool {
    #[serde(rename = "type")]
    pub(crate) r#type: String,
    pub(crate) function: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ChatApiRequest {
    pub(crate) model: String,
    pub(crate) messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) tools: Vec<Tool>,
    pub(crate) options: Options,
    pub(crate) stream: bool,
}

impl ChatApiRequest {
    pub(crate) fn from_request(model: String, request: &ChatRequest, stream: bool) -> Self {
        let tools = request
            .tools()
            .unwrap_or_default()
            .iter()
            .map(|t| Tool {
                r#type: "function".to_string(),
                function: serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }),
            })
            .collect();

        ChatApiRequest {
            model,
            messages: request.messages().iter().flat_map(to_messages).collect(),
            tools,
            options: Options {
                temperature: request.options().temperature,
                num_predict: request.options().max_tokens,
            },
            stream,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ChatApiResponse {
    pub(crate) message: Message,
    #[serde(default)]
    pub(crate) done: bool,
    #[serde(default)]
    pub(crate) prompt_eval_count: u64,
    #[serde(default)]
    pub(crate) eval_count: u64,
}

impl ChatApiResponse {
    /// Convert into a chat message; `call_prefix` seeds synthetic tool-call ids
    pub(crate) fn into_message(self, call_prefix: &str) -> ChatMessage {
        let tool_calls = self
            .message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ApiToolCall {
                id: format!("{}-{}", call_prefix, i),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();
        ChatMessage::assistant(ChatPayload::with_tool_calls(self.message.content, tool_calls))
            .with_usage(TokenUsage {
                prompt_tokens: self.prompt_eval_count,
                completion_tokens: self.eval_count,
            })
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct EmbedRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) input: &'a [String],
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct EmbedResponse {
    pub(crate) embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub(crate) prompt_eval_count: u64,
}
