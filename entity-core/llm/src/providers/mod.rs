pub(crate) mod ollama;
pub(crate) mod openai;

pub use ollama::{OllamaChatModel, OllamaEmbeddingModel, OllamaProvider};
pub use openai::{OpenAIChatModel, OpenAIEmbeddingModel, OpenAIProvider};

use crate::{ChatModel, EmbeddingModel, ModelDefinition, ModelProvider};
use async_trait::async_trait;
use engine_config::{ProviderKind, ProviderSettings};
use std::sync::Arc;

/// Every provider kind the engine can talk to
pub enum GeneralModelProvider {
    OpenAI(OpenAIProvider),
    Ollama(OllamaProvider),
}

impl GeneralModelProvider {
    /// Build a provider from its settings entry, reading the API key from the
    /// configured environment variable.
    pub fn from_settings(settings: &ProviderSettings) -> anyhow::Result<Self> {
        match settings.kind {
            ProviderKind::OpenAI => {
                let base_url = settings
                    .base_url
                    .as_deref()
                    .unwrap_or(openai::provider::DEFAULT_BASE_URL);
                let api_key = settings.api_key();
                Ok(GeneralModelProvider::OpenAI(OpenAIProvider::new(
                    base_url,
                    api_key.as_deref(),
                )?))
            }
            ProviderKind::Ollama => {
                let base_url = settings
                    .base_url
                    .as_deref()
                    .unwrap_or(ollama::provider::DEFAULT_BASE_URL);
                Ok(GeneralModelProvider::Ollama(OllamaProvider::new(base_url)))
            }
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            GeneralModelProvider::OpenAI(_) => ProviderKind::OpenAI,
            GeneralModelProvider::Ollama(_) => ProviderKind::Ollama,
        }
    }
}

#[async_trait]
impl ModelProvider for GeneralModelProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>> {
        match self {
            GeneralModelProvider::OpenAI(p) => p.list_models().await,
            GeneralModelProvider::Ollama(p) => p.list_models().await,
        }
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        match self {
            GeneralModelProvider::OpenAI(p) => p.create_chat_model(model_name),
            GeneralModelProvider::Ollama(p) => p.create_chat_model(model_name),
        }
    }

    fn create_embedding_model(
        &self,
        model_name: &str,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        match self {
            GeneralModelProvider::OpenAI(p) => p.create_embedding_model(model_name),
            GeneralModelProvider::Ollama(p) => p.create_embedding_model(model_name),
        }
    }
}
