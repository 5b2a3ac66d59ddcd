use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

pub mod api;
pub mod chain;
mod client;
pub mod error;
pub mod events;
pub mod health;
pub mod providers;
pub mod registry;
pub mod tools;
pub use api::*;
pub use chain::ModelChain;
pub use error::LlmError;
pub use events::{Observer, RegistryEvent, TracingObserver};
pub use health::HealthMonitor;
pub use providers::GeneralModelProvider;
pub use registry::{ModelHealth, ProviderRegistry, UsageStats};
pub use tools::{ToolInvocation, ToolRegistry};

pub type ChatStream = Pin<Box<dyn Stream<Item = ChatChunk> + Send>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelCapability {
    Text,
    Embedding,
}

#[derive(Clone, Debug)]
pub struct ModelDefinition {
    pub id: String,
    pub display_name: Option<String>,
    pub capabilities: Vec<ModelCapability>,
}

impl ModelDefinition {
    pub fn new(id: impl Into<String>, capabilities: Vec<ModelCapability>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            capabilities,
        }
    }

    pub fn text_model(id: impl Into<String>) -> Self {
        Self::new(id, vec![ModelCapability::Text])
    }

    /// Get the display name, falling back to id if not set
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn has_capability(&self, capability: &ModelCapability) -> bool {
        self.capabilities.contains(capability)
    }
}

#[async_trait]
pub trait ChatModel {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage>;

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream>;
}

// Blanket implementation for Arc<dyn ChatModel> to make it easier to work with
#[async_trait]
impl ChatModel for Arc<dyn ChatModel + Send + Sync> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        (**self).chat(request).await
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        (**self).stream_chat(request).await
    }
}

#[async_trait]
pub trait EmbeddingModel {
    fn name(&self) -> &str;

    /// Embed every input; dimensions is forwarded when the provider supports it
    async fn embed(
        &self,
        inputs: &[String],
        dimensions: Option<u32>,
    ) -> anyhow::Result<EmbeddingResponse>;
}

#[async_trait]
pub trait ModelProvider {
    /// List available models from the provider with their capabilities
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>>;

    /// Create a chat model by name, returned as Arc for sharing across threads
    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>>;

    /// Create an embedding model by name, if the provider serves embeddings
    fn create_embedding_model(
        &self,
        _model_name: &str,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        None
    }
}
