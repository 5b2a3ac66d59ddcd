use crate::api::EmbeddingResponse;
use crate::client::Client;
use crate::EmbeddingModel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize, Default)]
struct EmbeddingsUsage {
    #[serde(default)]
    prompt_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: EmbeddingsUsage,
}

#[derive(Clone)]
pub struct OpenAIEmbeddingModel {
    client: Client,
    base_url: String,
    model_name: String,
}

impl OpenAIEmbeddingModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        OpenAIEmbeddingModel {
            client,
            base_url,
            model_name,
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAIEmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn embed(
        &self,
        inputs: &[String],
        dimensions: Option<u32>,
    ) -> anyhow::Result<EmbeddingResponse> {
        let request = EmbeddingsRequest {
            model: &self.model_name,
            input: inputs,
            dimensions,
        };
        let mut response: EmbeddingsResponse = self
            .client
            .post(format!("{}/embeddings", self.base_url), &request)
            .await?;

        // The API does not promise ordering; `index` is authoritative
        response.data.sort_by_key(|d| d.index);
        Ok(EmbeddingResponse {
            embeddings: response.data.into_iter().map(|d| d.embedding).collect(),
            prompt_tokens: response.usage.prompt_tokens,
        })
    }
}
