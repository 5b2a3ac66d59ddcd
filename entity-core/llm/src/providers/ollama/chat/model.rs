use crate::api::{ChatChunk, ChatMessage, ChatRequest, EmbeddingResponse, Role};
use crate::client::{Client, ndjson};
use crate::{ChatModel, ChatStream, EmbeddingModel};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::api::{ChatApiRequest, ChatApiResponse, EmbedRequest, EmbedResponse};

pub struct OllamaChatModel {
    client: Client,
    base_url: String,
    model_name: String,
    calls: AtomicU64,
}

impl OllamaChatModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        OllamaChatModel {
            client,
            base_url,
            model_name,
            calls: AtomicU64::new(0),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        let api_request = ChatApiRequest::from_request(self.model_name.clone(), request, false);
        let response: ChatApiResponse = self.client.post(self.chat_url(), &api_request).await?;
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(response.into_message(&format!("ollama-{}", call)))
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        let api_request = ChatApiRequest::from_request(self.model_name.clone(), request, true);
        let stream = self
            .client
            .post_stream::<_, _, _, ChatApiResponse>(self.chat_url(), &api_request, ndjson)
            .await?;

        let call = self.calls.fetch_add(1, Ordering::Relaxed);

        // Tool calls arrive whole; token counts only on the `done` frame
        let chat_stream = stream.enumerate().filter_map(move |(n, chunk)| async move {
            let done = chunk.done;
            let message = chunk.into_message(&format!("ollama-{}-{}", call, n));
            if message.payload.content.is_empty() && !done {
                return None;
            }
            let out = ChatChunk::new(Role::Assistant, message.payload);
            Some(match message.usage.filter(|_| done) {
                Some(usage) => out.with_usage(usage),
                None => out,
            })
        });
        Ok(Box::pin(chat_stream))
    }
}

pub struct OllamaEmbeddingModel {
    client: Client,
    base_url: String,
    model_name: String,
}

impl OllamaEmbeddingModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        OllamaEmbeddingModel {
            client,
            base_url,
            model_name,
        }
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn embed(
        &self,
        inputs: &[String],
        _dimensions: Option<u32>,
    ) -> anyhow::Result<EmbeddingResponse> {
        let request = EmbedRequest {
            model: &self.model_name,
            input: inputs,
        };
        let response: EmbedResponse = self
            .client
            .post(format!("{}/api/embed", self.base_url), &request)
            .await?;
        Ok(EmbeddingResponse {
            embeddings: response.embeddings,
            prompt_tokens: response.prompt_eval_count,
        })
    }
}
