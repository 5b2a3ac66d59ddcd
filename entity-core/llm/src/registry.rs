//! Provider/model registry: resolves logical model ids to callable handles and
//! tracks per-provider health and per-model usage.

use crate::chain::ModelChain;
use crate::error::LlmError;
use crate::events::{Observer, Observers, RegistryEvent, TracingObserver, millis};
use crate::providers::GeneralModelProvider;
use crate::{ChatMessage, ChatModel, ChatRequest, ChatStream, EmbeddingModel, ModelProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_config::EngineSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Upper bound on a single health probe
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelHealth {
    pub is_healthy: bool,
    pub latency_ms: u64,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub total_tokens: u64,
    pub average_latency_ms: f64,
    /// `failed_calls / total_calls`, 0 before the first call
    pub error_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageStats {
    fn record_success(&mut self, latency: Duration, tokens: u64) {
        self.total_calls += 1;
        self.total_tokens += tokens;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms +=
            (latency_ms - self.average_latency_ms) / self.total_calls as f64;
        self.touch();
    }

    fn record_failure(&mut self) {
        self.total_calls += 1;
        self.failed_calls += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.error_rate = self.failed_calls as f64 / self.total_calls as f64;
        self.last_used = Some(Utc::now());
    }
}

struct ProviderEntry {
    provider: Arc<dyn ModelProvider + Send + Sync>,
    default_model: Option<String>,
    /// Provider-local alias -> model name
    aliases: BTreeMap<String, String>,
}

/// Resolved `(provider, model)` pair
#[derive(Clone, Debug, PartialEq, Eq)]
struct Target {
    provider: String,
    model: String,
}

impl Target {
    fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

type UsageTable = Arc<Mutex<BTreeMap<String, UsageStats>>>;

pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderEntry>,
    /// Global alias -> target
    aliases: BTreeMap<String, Target>,
    default_model: Option<String>,
    health: Mutex<BTreeMap<String, ModelHealth>>,
    usage: UsageTable,
    observers: Observers,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Empty registry logging its events through `tracing`
    pub fn new() -> Self {
        let mut observers = Observers::default();
        observers.add(Arc::new(TracingObserver));
        ProviderRegistry {
            providers: BTreeMap::new(),
            aliases: BTreeMap::new(),
            default_model: None,
            health: Mutex::new(BTreeMap::new()),
            usage: Arc::new(Mutex::new(BTreeMap::new())),
            observers,
        }
    }

    /// Build a registry from the `[providers]` and `[ai]` settings tables.
    ///
    /// Providers that fail to construct are skipped with a warning.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut registry = Self::new();
        for (name, provider_settings) in &settings.providers {
            match GeneralModelProvider::from_settings(provider_settings) {
                Ok(provider) => {
                    registry.register_provider(
                        name,
                        Arc::new(provider),
                        provider_settings.default_model.clone(),
                    );
                    for (alias, model) in &provider_settings.models {
                        registry.register_provider_alias(name, alias, model);
                    }
                }
                Err(e) => warn!("Skipping provider '{}': {}", name, e),
            }
        }
        if let Some(default_model) = &settings.ai.default_model {
            registry.set_default_model(default_model);
        }
        registry
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.add(observer);
    }

    pub fn register_provider(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn ModelProvider + Send + Sync>,
        default_model: Option<String>,
    ) {
        self.providers.insert(
            name.into(),
            ProviderEntry {
                provider,
                default_model,
                aliases: BTreeMap::new(),
            },
        );
    }

    /// Register a global alias resolving to `provider`'s `model`
    pub fn register_model(
        &mut self,
        alias: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) {
        self.aliases.insert(
            alias.into(),
            Target {
                provider: provider.into(),
                model: model.into(),
            },
        );
    }

    fn register_provider_alias(&mut self, provider: &str, alias: &str, model: &str) {
        if let Some(entry) = self.providers.get_mut(provider) {
            entry.aliases.insert(alias.to_string(), model.to_string());
        }
    }

    pub fn set_default_model(&mut self, id: impl Into<String>) {
        self.default_model = Some(id.into());
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Resolve an id without falling back to the default model.
    ///
    /// Order: global alias, bare provider name (its default model), then a
    /// `provider:model` or `provider/model` prefix split.
    fn resolve_exact(&self, id: &str) -> Option<Target> {
        if let Some(target) = self.aliases.get(id) {
            if self.providers.contains_key(&target.provider) {
                return Some(target.clone());
            }
        }

        if let Some(entry) = self.providers.get(id) {
            if let Some(model) = &entry.default_model {
                return Some(Target {
                    provider: id.to_string(),
                    model: model.clone(),
                });
            }
        }

        let (provider, model) = id.split_once(':').or_else(|| id.split_once('/'))?;
        let entry = self.providers.get(provider)?;
        if model.is_empty() {
            return None;
        }
        let model = entry.aliases.get(model).map(String::as_str).unwrap_or(model);
        Some(Target {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }

    /// Resolve `id`, falling back to the default model; never fails loudly
    fn resolve(&self, id: Option<&str>) -> Option<Target> {
        if let Some(id) = id {
            if let Some(target) = self.resolve_exact(id) {
                return Some(target);
            }
            self.observers.emit(RegistryEvent::ModelResolutionFailed {
                requested: id.to_string(),
                reason: "no matching alias, provider or provider:model".to_string(),
            });
        }

        let default = self.default_model.as_deref()?;
        let target = self.resolve_exact(default);
        if target.is_none() {
            self.observers.emit(RegistryEvent::ModelResolutionFailed {
                requested: default.to_string(),
                reason: "default model does not resolve".to_string(),
            });
        }
        target
    }

    fn chat_model_for(
        &self,
        requested: Option<&str>,
        target: &Target,
    ) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        let entry = self.providers.get(&target.provider)?;
        let inner = entry.provider.create_chat_model(&target.model)?;
        self.observers.emit(RegistryEvent::ModelResolved {
            requested: requested.map(str::to_string),
            provider: target.provider.clone(),
            model: target.model.clone(),
        });
        Some(Arc::new(ObservedChatModel {
            inner,
            key: target.key(),
            usage: self.usage.clone(),
            observers: self.observers.clone(),
        }))
    }

    /// Resolve a chat model; `None` picks the configured default
    pub fn get_language_model(&self, id: Option<&str>) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        let target = self.resolve(id)?;
        self.chat_model_for(id, &target)
    }

    pub fn require_language_model(
        &self,
        id: Option<&str>,
    ) -> Result<Arc<dyn ChatModel + Send + Sync>, LlmError> {
        self.get_language_model(id).ok_or_else(|| {
            LlmError::ModelUnavailable(
                id.or(self.default_model.as_deref())
                    .unwrap_or("<default>")
                    .to_string(),
            )
        })
    }

    /// Resolve an embedding model the same way chat models are resolved
    pub fn get_embedding_model(
        &self,
        id: Option<&str>,
    ) -> Option<Arc<dyn EmbeddingModel + Send + Sync>> {
        let target = self.resolve(id)?;
        let entry = self.providers.get(&target.provider)?;
        entry.provider.create_embedding_model(&target.model)
    }

    /// Primary model plus every fallback that resolves, in order.
    ///
    /// Fallbacks never fall back to the default themselves and duplicates of
    /// an earlier entry are skipped.
    pub fn create_model_chain(
        &self,
        primary: Option<&str>,
        fallbacks: &[String],
    ) -> Result<ModelChain, LlmError> {
        let mut targets: Vec<(Option<&str>, Target)> = Vec::new();
        if let Some(target) = self.resolve(primary) {
            targets.push((primary, target));
        }
        for fallback in fallbacks {
            match self.resolve_exact(fallback) {
                Some(target) if !targets.iter().any(|(_, t)| *t == target) => {
                    targets.push((Some(fallback.as_str()), target));
                }
                Some(_) => {}
                None => self.observers.emit(RegistryEvent::ModelResolutionFailed {
                    requested: fallback.clone(),
                    reason: "fallback does not resolve".to_string(),
                }),
            }
        }

        let models: Vec<_> = targets
            .iter()
            .filter_map(|(requested, target)| self.chat_model_for(*requested, target))
            .collect();
        if models.is_empty() {
            return Err(LlmError::ModelUnavailable(
                primary
                    .or(self.default_model.as_deref())
                    .unwrap_or("<default>")
                    .to_string(),
            ));
        }
        Ok(ModelChain::new(models).with_observers(self.observers.clone()))
    }

    /// Probe one provider by listing its models; never errors.
    pub async fn check_provider_health(&self, name: &str) -> ModelHealth {
        let started = Instant::now();
        let outcome = match self.providers.get(name) {
            Some(entry) => {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, entry.provider.list_models()).await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "health probe timed out after {}s",
                        HEALTH_PROBE_TIMEOUT.as_secs()
                    )),
                }
            }
            None => Err(format!("unknown provider '{}'", name)),
        };

        let health = ModelHealth {
            is_healthy: outcome.is_ok(),
            latency_ms: millis(started.elapsed()),
            last_check: Utc::now(),
            error: outcome.err(),
        };
        self.observers.emit(RegistryEvent::HealthChecked {
            provider: name.to_string(),
            healthy: health.is_healthy,
            latency_ms: health.latency_ms,
            error: health.error.clone(),
        });
        self.health
            .lock()
            .await
            .insert(name.to_string(), health.clone());
        health
    }

    pub async fn check_all_providers_health(&self) -> BTreeMap<String, ModelHealth> {
        let names = self.provider_names();
        let results =
            futures::future::join_all(names.iter().map(|name| self.check_provider_health(name)))
                .await;
        names.into_iter().zip(results).collect()
    }

    /// Last recorded health of a provider
    pub async fn health(&self, provider: &str) -> Option<ModelHealth> {
        self.health.lock().await.get(provider).cloned()
    }

    /// Usage of a model, keyed `provider:model`
    pub async fn usage(&self, model_key: &str) -> Option<UsageStats> {
        self.usage.lock().await.get(model_key).cloned()
    }
}

/// Chat model handle that records usage and emits call events
struct ObservedChatModel {
    inner: Arc<dyn ChatModel + Send + Sync>,
    key: String,
    usage: UsageTable,
    observers: Observers,
}

impl ObservedChatModel {
    /// `outcome` is the token count on success or the error text on failure
    async fn record(&self, started: Instant, outcome: Result<u64, String>) {
        let latency = started.elapsed();
        let mut usage = self.usage.lock().await;
        let stats = usage.entry(self.key.clone()).or_default();
        match outcome {
            Ok(tokens) => {
                stats.record_success(latency, tokens);
                self.observers.emit(RegistryEvent::ModelCallSucceeded {
                    model: self.key.clone(),
                    latency_ms: millis(latency),
                    tokens,
                });
            }
            Err(error) => {
                stats.record_failure();
                self.observers.emit(RegistryEvent::ModelCallFailed {
                    model: self.key.clone(),
                    error,
                });
            }
        }
    }
}

#[async_trait]
impl ChatModel for ObservedChatModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<ChatMessage> {
        let started = Instant::now();
        let result = self.inner.chat(request).await;
        let outcome = match &result {
            Ok(message) => Ok(message.usage.map(|u| u.total()).unwrap_or(0)),
            Err(e) => Err(e.to_string()),
        };
        self.record(started, outcome).await;
        result
    }

    async fn stream_chat(&self, request: &ChatRequest) -> anyhow::Result<ChatStream> {
        let started = Instant::now();
        let result = self.inner.stream_chat(request).await;
        let outcome = match &result {
            Ok(_) => Ok(0),
            Err(e) => Err(e.to_string()),
        };
        self.record(started, outcome).await;
        result
    }
}
