//! Registry lifecycle events and the observers they are delivered to

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistryEvent {
    #[serde(rename_all = "camelCase")]
    ModelResolved {
        requested: Option<String>,
        provider: String,
        model: String,
    },
    #[serde(rename_all = "camelCase")]
    ModelResolutionFailed { requested: String, reason: String },
    #[serde(rename_all = "camelCase")]
    HealthChecked {
        provider: String,
        healthy: bool,
        latency_ms: u64,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ModelCallSucceeded {
        model: String,
        latency_ms: u64,
        tokens: u64,
    },
    #[serde(rename_all = "camelCase")]
    ModelCallFailed { model: String, error: String },
    #[serde(rename_all = "camelCase")]
    FallbackTriggered {
        failed: String,
        next: String,
        error: String,
    },
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Receives registry events; implementations must not block
pub trait Observer: Send + Sync {
    fn notify(&self, event: &RegistryEvent);
}

/// Default observer writing every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notify(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::ModelResolved {
                requested,
                provider,
                model,
            } => debug!(?requested, %provider, %model, "Resolved model"),
            RegistryEvent::ModelResolutionFailed { requested, reason } => {
                warn!(%requested, %reason, "Model resolution failed")
            }
            RegistryEvent::HealthChecked {
                provider,
                healthy,
                latency_ms,
                error,
            } => {
                if *healthy {
                    debug!(%provider, latency_ms, "Provider healthy");
                } else {
                    warn!(%provider, latency_ms, ?error, "Provider unhealthy");
                }
            }
            RegistryEvent::ModelCallSucceeded {
                model,
                latency_ms,
                tokens,
            } => debug!(%model, latency_ms, tokens, "Model call succeeded"),
            RegistryEvent::ModelCallFailed { model, error } => {
                warn!(%model, %error, "Model call failed")
            }
            RegistryEvent::FallbackTriggered {
                failed,
                next,
                error,
            } => info!(%failed, %next, %error, "Falling back to next model"),
        }
    }
}

/// Fan-out over the injected observers
#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub(crate) fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub(crate) fn emit(&self, event: RegistryEvent) {
        for observer in &self.observers {
            observer.notify(&event);
        }
    }
}
