use super::chat::api::ListModelsResponse;
use super::chat::{OllamaChatModel, OllamaEmbeddingModel};
use crate::client::Client;
use crate::{ChatModel, EmbeddingModel, ModelProvider};
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str) -> Self {
        OllamaProvider {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<crate::ModelDefinition>> {
        let url = format!("{}/api/tags", self.base_url);
        let response: ListModelsResponse = self.client.get(&url).await?;
        Ok(response.models.into_iter().map(|m| m.into()).collect())
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(OllamaChatModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }

    fn create_embedding_model(
        &self,
        model_name: &str,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        Some(Arc::new(OllamaEmbeddingModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }
}
