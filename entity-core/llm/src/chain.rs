use crate::error::LlmError;
use crate::events::{Observers, RegistryEvent};
use crate::{ChatMessage, ChatModel, ChatRequest, ChatStream};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Ordered list of models tried until one succeeds
pub struct ModelChain {
    models: Vec<Arc<dyn ChatModel + Send + Sync>>,
    observers: Observers,
}

impl ModelChain {
    /// The first model is the primary, the rest are fallbacks in order
    pub fn new(models: Vec<Arc<dyn ChatModel + Send + Sync>>) -> Self {
        ModelChain {
            models,
            observers: Observers::default(),
        }
    }

    pub(crate) fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn primary(&self) -> Option<&Arc<dyn ChatModel + Send + Sync>> {
        self.models.first()
    }

    /// Run `op` against each model in turn; the first success wins.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, LlmError>
    where
        F: Fn(Arc<dyn ChatModel + Send + Sync>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut errors = Vec::new();
        for (i, model) in self.models.iter().enumerate() {
            match op(model.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let Some(next) = self.models.get(i + 1) {
                        self.observers.emit(RegistryEvent::FallbackTriggered {
                            failed: model.name().to_string(),
                            next: next.name().to_string(),
                            error: e.to_string(),
                        });
                    }
                    errors.push(format!("{}: {}", model.name(), e));
                }
            }
        }
        Err(LlmError::AllModelsFailed(errors))
    }
}

#[async_trait]
impl ChatModel for ModelChain {
    fn name(&self) -> &str {
        self.primary().map(|m| m.name()).unwrap_or("empty-chain")
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        Ok(self
            .execute(|model| async move { model.chat(request).await })
            .await?)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        Ok(self
            .execute(|model| async move { model.stream_chat(request).await })
            .await?)
    }
}
