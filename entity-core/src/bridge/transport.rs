//! Delivery of frontend tool results back to the waiting server call

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::controller::FrontendToolExecutor;
use super::pending::PendingToolCalls;
use crate::agent::ChatEvent;
use crate::ids::WaitId;

/// Body of `POST /frontend-tool-result`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub wait_id: WaitId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds at which the client produced the result
    #[serde(default)]
    pub timestamp: i64,
}

impl ToolResultPayload {
    pub fn success(wait_id: WaitId, result: Value) -> Self {
        ToolResultPayload {
            wait_id,
            result: Some(result),
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(wait_id: WaitId, error: impl Into<String>) -> Self {
        ToolResultPayload {
            wait_id,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Settle the matching wait entry; false when nothing was waiting
    pub fn deliver(self, pending: &PendingToolCalls) -> bool {
        match self.error {
            Some(error) => pending.reject(&self.wait_id, error),
            None => pending.resolve(&self.wait_id, self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Posts tool results to the server's result endpoint
#[derive(Clone)]
pub struct ToolResultClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ToolResultClient {
    /// `endpoint` is the full URL of `/frontend-tool-result`
    pub fn new(endpoint: impl Into<String>) -> Self {
        ToolResultClient {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, payload), fields(wait_id = %payload.wait_id))]
    pub async fn post(&self, payload: &ToolResultPayload) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Picks frontend tool requests out of a chat event stream, runs them
/// locally and posts the outcome back
#[derive(Clone)]
pub struct FrontendToolInterceptor {
    executor: FrontendToolExecutor,
    client: ToolResultClient,
}

impl FrontendToolInterceptor {
    pub fn new(executor: FrontendToolExecutor, client: ToolResultClient) -> Self {
        FrontendToolInterceptor { executor, client }
    }

    /// Returns whether the event was a frontend tool request
    pub async fn handle(&self, event: &ChatEvent) -> anyhow::Result<bool> {
        let ChatEvent::FrontendToolRequest {
            wait_id,
            tool_name,
            input,
            ..
        } = event
        else {
            return Ok(false);
        };

        let payload = match self.executor.execute(tool_name, input.clone()).await {
            Ok(result) => ToolResultPayload::success(wait_id.clone(), result),
            Err(e) => {
                tracing::warn!(tool = %tool_name, "Frontend tool failed: {}", e);
                ToolResultPayload::failure(wait_id.clone(), e.to_string())
            }
        };
        self.client.post(&payload).await?;
        Ok(true)
    }
}
