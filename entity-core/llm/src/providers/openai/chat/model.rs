use crate::api::{ChatChunk, ChatMessage, ChatPayload, ChatRequest, Role, TokenUsage};
use crate::client::{Client, sse_data};
use crate::ChatModel;
use crate::ChatStream;
use async_trait::async_trait;
use futures::StreamExt;

use super::api::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ToolCallBuffer,
};

#[derive(Clone)]
pub struct OpenAIChatModel {
    client: Client,
    base_url: String,
    model_name: String,
}

impl OpenAIChatModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        OpenAIChatModel {
            client,
            base_url,
            model_name,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        let openai_request =
            ChatCompletionRequest::from_request(self.model_name.clone(), request, false);
        let response: ChatCompletionResponse =
            self.client.post(self.chat_url(), &openai_request).await?;
        ChatMessage::try_from(response)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        let openai_request =
            ChatCompletionRequest::from_request(self.model_name.clone(), request, true);

        let stream = self
            .client
            .post_stream::<_, _, _, ChatCompletionChunk>(self.chat_url(), &openai_request, sse_data)
            .await?;

        // Text is forwarded as it arrives; tool-call fragments and usage are
        // held back and emitted as one closing chunk
        let chat_stream = futures::stream::unfold(
            Some((stream, ToolCallBuffer::default(), None::<TokenUsage>)),
            |state| async move {
                let (mut stream, mut buffer, mut usage) = state?;
                while let Some(chunk) = stream.next().await {
                    if let Some(u) = chunk.usage {
                        usage = Some(u.into());
                    }
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(deltas) = choice.delta.tool_calls {
                        buffer.push(deltas);
                    }
                    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                        let chunk = ChatChunk::new(Role::Assistant, ChatPayload::text(content));
                        return Some((chunk, Some((stream, buffer, usage))));
                    }
                }

                if buffer.is_empty() && usage.is_none() {
                    return None;
                }
                let mut last = ChatChunk::new(
                    Role::Assistant,
                    ChatPayload::with_tool_calls(String::new(), buffer.take()),
                );
                if let Some(usage) = usage {
                    last = last.with_usage(usage);
                }
                Some((last, None))
            },
        );

        Ok(Box::pin(chat_stream))
    }
}
