//! Multi-step tool-calling loop and the events it streams to the client

use futures::StreamExt;
use llm::{
    ChatMessage, ChatModel, ChatPayload, ChatRequest, ContentBlock, GenerationOptions,
    TokenUsage, ToolInvocation, ToolRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{EngineError, Result};
use crate::ids::WaitId;
use crate::sanitize::ErrorCategory;

/// Default bound on model round-trips per chat turn
pub const DEFAULT_MAX_STEPS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    /// The step budget ran out while the model still wanted tools
    Length,
    Error,
}

/// One frame of a streamed chat response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    TextDelta {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: String,
    },
    /// Ask the client to run a frontend tool and post the result under `wait_id`
    #[serde(rename_all = "camelCase")]
    FrontendToolRequest {
        wait_id: WaitId,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    StepFinish {
        step: usize,
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
    Error {
        message: String,
        category: ErrorCategory,
    },
    Object {
        object: Value,
    },
}

/// Multi-step tool loop
///
/// Calls the model with every registered tool until it answers without tool
/// calls or `max_steps` model calls have been made. Tool failures are fed back
/// to the model as `Error: ...` results so it can correct itself.
pub struct ToolLoop {
    tools: Arc<ToolRegistry>,
    max_steps: usize,
}

impl ToolLoop {
    pub fn new(tools: Arc<ToolRegistry>, max_steps: usize) -> Self {
        Self {
            tools,
            max_steps: max_steps.max(1),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Run the loop, streaming events to `events`.
    ///
    /// Returns the messages produced (assistant turns and tool results).
    /// Stops with [`EngineError::StreamClosed`] as soon as the receiver is
    /// dropped; an in-flight tool call is dropped with it.
    pub async fn run(
        &self,
        model: Arc<dyn ChatModel + Send + Sync>,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
        events: &UnboundedSender<ChatEvent>,
    ) -> Result<Vec<ChatMessage>> {
        let mut working_context = messages;
        let mut produced = Vec::new();
        let mut total = TokenUsage::default();

        for step in 1..=self.max_steps {
            let request =
                ChatRequest::with_tools(working_context.iter(), self.tools.get_all_definitions())
                    .with_options(options);

            let response = stream_step(model.as_ref(), &request, events).await?;
            if let Some(usage) = response.usage {
                total.prompt_tokens += usage.prompt_tokens;
                total.completion_tokens += usage.completion_tokens;
            }

            let tool_calls: Vec<llm::ToolCall> =
                response.get_tool_calls().into_iter().cloned().collect();
            let usage = response.usage;
            working_context.push(response.clone());
            produced.push(response);

            if tool_calls.is_empty() {
                emit(
                    events,
                    ChatEvent::StepFinish {
                        step,
                        finish_reason: FinishReason::Stop,
                        usage,
                    },
                )?;
                emit(
                    events,
                    ChatEvent::Finish {
                        finish_reason: FinishReason::Stop,
                        usage: total,
                    },
                )?;
                return Ok(produced);
            }

            for tool_call in tool_calls {
                emit(
                    events,
                    ChatEvent::ToolCall {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                        args: tool_call.arguments.clone(),
                    },
                )?;

                let call = self.tools.call(ToolInvocation {
                    call_id: tool_call.id.clone(),
                    name: tool_call.name.clone(),
                    arguments: tool_call.arguments,
                });
                let result = tokio::select! {
                    result = call => result.unwrap_or_else(|e| format!("Error: {}", e)),
                    _ = events.closed() => {
                        tracing::info!("Chat stream closed during tool {}, stopping", tool_call.name);
                        return Err(EngineError::StreamClosed);
                    }
                };

                emit(
                    events,
                    ChatEvent::ToolResult {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name,
                        result: result.clone(),
                    },
                )?;

                let result_msg = ChatMessage::user(ChatPayload::tool_result(tool_call.id, result));
                working_context.push(result_msg.clone());
                produced.push(result_msg);
            }

            emit(
                events,
                ChatEvent::StepFinish {
                    step,
                    finish_reason: FinishReason::ToolCalls,
                    usage,
                },
            )?;
        }

        tracing::warn!("Tool loop reached max steps ({}), stopping", self.max_steps);
        emit(
            events,
            ChatEvent::Finish {
                finish_reason: FinishReason::Length,
                usage: total,
            },
        )?;
        Ok(produced)
    }
}

fn emit(events: &UnboundedSender<ChatEvent>, event: ChatEvent) -> Result<()> {
    events.send(event).map_err(|_| EngineError::StreamClosed)
}

/// One streamed model call: text goes out as it arrives, and the chunks are
/// gathered into the assistant message for the next step.
async fn stream_step(
    model: &(dyn ChatModel + Send + Sync),
    request: &ChatRequest,
    events: &UnboundedSender<ChatEvent>,
) -> Result<ChatMessage> {
    let mut stream = model.stream_chat(request).await?;
    let mut response = ChatMessage::assistant(ChatPayload::default());

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = events.closed() => return Err(EngineError::StreamClosed),
        };
        let Some(chunk) = chunk else {
            break;
        };

        let text = chunk.get_text();
        if !text.is_empty() {
            emit(events, ChatEvent::TextDelta { text })?;
        }
        if chunk.usage.is_some() {
            response.usage = chunk.usage;
        }
        for block in chunk.payload.content {
            if let ContentBlock::Text { text } = &block {
                if let Some(ContentBlock::Text { text: gathered }) =
                    response.payload.content.last_mut()
                {
                    gathered.push_str(text);
                    continue;
                }
            }
            response.payload.content.push(block);
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{
        BridgeHandle, FrontendToolExecutor, PendingToolCalls, RECORD_SET_VALUES, TestForm,
        ToolResultPayload, register_frontend_tools,
    };
    use crate::model::{FieldDefinition, FieldType};
    use async_trait::async_trait;
    use llm::{ChatChunk, ChatStream, Role, ToolCall, ToolDefinition};
    use schemars::JsonSchema;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Replays scripted responses and records the requests it saw
    struct ScriptedModel {
        responses: Mutex<Vec<ChatMessage>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(mut responses: Vec<ChatMessage>) -> Arc<Self> {
            responses.reverse();
            Arc::new(ScriptedModel {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }

        /// Text goes out a word at a time; tool calls and usage close the stream
        async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
            let message = self.chat(request).await?;
            let mut chunks: Vec<ChatChunk> = message
                .get_text()
                .split_inclusive(' ')
                .map(|word| ChatChunk::assistant(word.to_string()))
                .collect();
            let calls = message.get_tool_calls().into_iter().cloned().collect();
            let last = ChatChunk::new(Role::Assistant, ChatPayload::with_tool_calls(String::new(), calls));
            chunks.push(match message.usage {
                Some(usage) => last.with_usage(usage),
                None => last,
            });
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> ChatMessage {
        ChatMessage::assistant(ChatPayload::with_tool_calls(
            String::new(),
            vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
        ))
    }

    #[derive(Deserialize, JsonSchema)]
    struct EchoInput {
        text: String,
    }

    fn echo_tools() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(
            ToolDefinition::for_input::<EchoInput>("echo", "Echo text"),
            |invocation: ToolInvocation| async move {
                let input: EchoInput = serde_json::from_value(invocation.arguments)?;
                Ok(input.text)
            },
        );
        Arc::new(tools)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_tool_step_then_answer() {
        let model = ScriptedModel::new(vec![
            tool_call("call_1", "echo", json!({"text": "pong"})),
            ChatMessage::assistant("Done").with_usage(TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
            }),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let produced = ToolLoop::new(echo_tools(), DEFAULT_MAX_STEPS)
            .run(model.clone(), vec![ChatMessage::user("ping")], GenerationOptions::default(), &tx)
            .await
            .unwrap();

        assert_eq!(produced.len(), 3);
        assert_eq!(produced[1].get_tool_results()[0].content, "pong");

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ChatEvent::ToolCall { tool_name, .. } if tool_name == "echo"));
        assert!(matches!(&events[1], ChatEvent::ToolResult { result, .. } if result == "pong"));
        assert!(matches!(events.last(), Some(ChatEvent::Finish { finish_reason: FinishReason::Stop, usage }) if usage.total() == 7));

        // Second request carries the tool result
        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[1].messages().len(), 3);
        assert!(requests[1].tools().is_some());
    }

    #[tokio::test]
    async fn test_text_streams_in_several_deltas() {
        let model = ScriptedModel::new(vec![ChatMessage::assistant("The order was placed")]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let produced = ToolLoop::new(echo_tools(), DEFAULT_MAX_STEPS)
            .run(model, vec![ChatMessage::user("status?")], GenerationOptions::default(), &tx)
            .await
            .unwrap();

        let events = drain(&mut rx);
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["The ", "order ", "was ", "placed"]);
        assert!(matches!(&events[4], ChatEvent::StepFinish { step: 1, finish_reason: FinishReason::Stop, .. }));

        // Deltas are gathered back into one text block for the history
        assert_eq!(produced[0].payload.content.len(), 1);
        assert_eq!(produced[0].get_text(), "The order was placed");
    }

    #[tokio::test]
    async fn test_closed_receiver_stops_the_loop() {
        let model = ScriptedModel::new(vec![
            tool_call("call_1", "echo", json!({"text": "one"})),
            tool_call("call_2", "echo", json!({"text": "two"})),
            ChatMessage::assistant("never reached"),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let err = ToolLoop::new(echo_tools(), DEFAULT_MAX_STEPS)
            .run(model.clone(), vec![ChatMessage::user("go")], GenerationOptions::default(), &tx)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::StreamClosed));
        assert_eq!(model.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_frontend_call() {
        let pending = Arc::new(PendingToolCalls::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tools = ToolRegistry::new();
        register_frontend_tools(&mut tools, pending.clone(), tx.clone(), Duration::from_secs(30));

        let model = ScriptedModel::new(vec![
            tool_call("call_1", RECORD_SET_VALUES, json!({"values": {"name": "Ada"}})),
            ChatMessage::assistant("unreachable"),
        ]);
        let tool_loop = ToolLoop::new(Arc::new(tools), DEFAULT_MAX_STEPS);
        let run = tokio::spawn(async move {
            tool_loop
                .run(model, vec![ChatMessage::user("fill")], GenerationOptions::default(), &tx)
                .await
        });

        // Wait for the browser request, then walk away without answering
        loop {
            match rx.recv().await {
                Some(ChatEvent::FrontendToolRequest { .. }) => break,
                Some(_) => continue,
                None => panic!("loop ended before the frontend request"),
            }
        }
        assert_eq!(pending.len(), 1);
        drop(rx);

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("loop kept waiting after disconnect")
            .unwrap();
        assert!(matches!(result, Err(EngineError::StreamClosed)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_tool_errors_are_fed_back() {
        let model = ScriptedModel::new(vec![
            tool_call("call_1", "missing", json!({})),
            tool_call("call_2", "echo", json!({"wrong": 1})),
            ChatMessage::assistant("Giving up"),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let produced = ToolLoop::new(echo_tools(), DEFAULT_MAX_STEPS)
            .run(model, vec![ChatMessage::user("go")], GenerationOptions::default(), &tx)
            .await
            .unwrap();

        assert!(produced[1].get_tool_results()[0].content.starts_with("Error: "));
        assert!(produced[3].get_tool_results()[0].content.starts_with("Error: "));
        assert_eq!(produced[4].get_text(), "Giving up");
    }

    #[tokio::test]
    async fn test_max_steps_bounds_the_loop() {
        let model = ScriptedModel::new(
            (0..10)
                .map(|i| tool_call(&format!("call_{}", i), "echo", json!({"text": "again"})))
                .collect(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        ToolLoop::new(echo_tools(), 2)
            .run(model.clone(), vec![ChatMessage::user("loop")], GenerationOptions::default(), &tx)
            .await
            .unwrap();

        assert_eq!(model.requests.lock().unwrap().len(), 2);
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(ChatEvent::Finish { finish_reason: FinishReason::Length, .. })));
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let model = ScriptedModel::new(vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ToolLoop::new(echo_tools(), 3)
            .run(model, vec![ChatMessage::user("hi")], GenerationOptions::default(), &tx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_frontend_tool_round_trip_through_loop() {
        let pending = Arc::new(PendingToolCalls::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tools = ToolRegistry::new();
        register_frontend_tools(&mut tools, pending.clone(), tx.clone(), Duration::from_secs(5));

        // Browser side: a form whose only field is `name`
        let bridge = BridgeHandle::new();
        let form = Arc::new(TestForm::new(vec![FieldDefinition::new("name", FieldType::String)]));
        let _guard = bridge.mount(form.clone());
        let executor = FrontendToolExecutor::new(bridge);
        let client_pending = pending.clone();
        let client = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if let ChatEvent::FrontendToolRequest { wait_id, tool_name, input, .. } = &event {
                    let result = executor.execute(tool_name, input.clone()).await.unwrap();
                    ToolResultPayload::success(wait_id.clone(), result).deliver(&client_pending);
                }
                let done = matches!(event, ChatEvent::Finish { .. });
                seen.push(event);
                if done {
                    break;
                }
            }
            seen
        });

        let model = ScriptedModel::new(vec![
            tool_call("call_1", RECORD_SET_VALUES, json!({"values": {"unknownField": "x"}})),
            ChatMessage::assistant("I could not set that field"),
        ]);
        let produced = ToolLoop::new(Arc::new(tools), DEFAULT_MAX_STEPS)
            .run(model, vec![ChatMessage::user("set it")], GenerationOptions::default(), &tx)
            .await
            .unwrap();

        let output: Value = serde_json::from_str(&produced[1].get_tool_results()[0].content).unwrap();
        assert_eq!(output["success"], false);
        assert!(output["error"].as_str().unwrap().contains("unknownField"));
        assert!(output["error"].as_str().unwrap().contains("name"));
        assert!(form.values.lock().await.is_empty());

        let seen = client.await.unwrap();
        assert!(seen.iter().any(|e| matches!(e, ChatEvent::FrontendToolRequest { .. })));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_event_wire_names() {
        let event = ChatEvent::FrontendToolRequest {
            wait_id: WaitId::from_string("recordGetValues-1-00000000"),
            tool_call_id: "call_1".to_string(),
            tool_name: "recordGetValues".to_string(),
            input: json!({}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "frontend-tool-request");
        assert_eq!(json["waitId"], "recordGetValues-1-00000000");
        assert_eq!(json["toolCallId"], "call_1");

        let json = serde_json::to_value(ChatEvent::TextDelta { text: "a".to_string() }).unwrap();
        assert_eq!(json, json!({"type": "text-delta", "text": "a"}));
    }
}
