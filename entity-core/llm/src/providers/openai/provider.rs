use crate::client::Client;
use crate::{ChatModel, EmbeddingModel, ModelProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;

use super::chat::api::ListModelsResponse;
use super::chat::OpenAIChatModel;
use super::embeddings::OpenAIEmbeddingModel;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const API_VERSION: &str = "v1";

/// Provider for the OpenAI API and OpenAI-compatible gateways
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a provider against `base_url`; the `/v1` path is appended.
    pub fn new(base_url: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))?,
            );
        }

        let base_url = base_url.trim_end_matches('/');
        let base_url = if base_url.ends_with(API_VERSION) {
            base_url.to_string()
        } else {
            format!("{}/{}", base_url, API_VERSION)
        };
        Ok(OpenAIProvider {
            client: Client::with_headers(headers)?,
            base_url,
        })
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<crate::ModelDefinition>> {
        let response: ListModelsResponse = self.client.get(self.models_url()).await?;
        Ok(response.data.into_iter().map(|m| m.into()).collect())
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(OpenAIChatModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }

    fn create_embedding_model(
        &self,
        model_name: &str,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        Some(Arc::new(OpenAIEmbeddingModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }
}
