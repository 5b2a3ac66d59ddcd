//! Frontend-proxied tools: definitions and the server-side proxy handlers

use llm::{ToolDefinition, ToolInvocation, ToolRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::pending::PendingToolCalls;
use crate::agent::ChatEvent;

pub const RECORD_GET_VALUES: &str = "recordGetValues";
pub const RECORD_SET_VALUES: &str = "recordSetValues";
pub const RECORD_GET_FIELD_INFO: &str = "recordGetFieldInfo";
pub const RECORD_RESET_FORM: &str = "recordResetForm";
pub const RECORD_VALIDATE_FORM: &str = "recordValidateForm";

pub const FRONTEND_TOOLS: [&str; 5] = [
    RECORD_GET_VALUES,
    RECORD_SET_VALUES,
    RECORD_GET_FIELD_INFO,
    RECORD_RESET_FORM,
    RECORD_VALIDATE_FORM,
];

pub fn is_frontend_tool(name: &str) -> bool {
    FRONTEND_TOOLS.contains(&name)
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GetValuesInput {
    /// Field names to read; every field when omitted
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct SetValuesInput {
    /// Field name -> new value. Names must come from recordGetFieldInfo.
    pub values: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NoInput {}

pub fn frontend_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::for_input::<GetValuesInput>(
            RECORD_GET_VALUES,
            "Read the current values of the record open in the user's form",
        ),
        ToolDefinition::for_input::<SetValuesInput>(
            RECORD_SET_VALUES,
            "Set field values on the record open in the user's form. \
             Call recordGetFieldInfo first to learn the valid field names.",
        ),
        ToolDefinition::for_input::<NoInput>(
            RECORD_GET_FIELD_INFO,
            "List the fields of the form the user is looking at, with types and options",
        ),
        ToolDefinition::for_input::<NoInput>(
            RECORD_RESET_FORM,
            "Discard unsaved changes in the user's form",
        ),
        ToolDefinition::for_input::<NoInput>(
            RECORD_VALIDATE_FORM,
            "Validate the user's form and return the list of errors",
        ),
    ]
}

/// Install proxy handlers for every frontend tool.
///
/// Each call registers a wait entry, asks the client to run the tool through a
/// `frontend-tool-request` event on `events`, and suspends until the client
/// posts the result back or `timeout` elapses.
pub fn register_frontend_tools(
    registry: &mut ToolRegistry,
    pending: Arc<PendingToolCalls>,
    events: UnboundedSender<ChatEvent>,
    timeout: Duration,
) {
    for definition in frontend_tool_definitions() {
        let pending = pending.clone();
        let events = events.clone();
        registry.register(definition, move |invocation| {
            proxy(pending.clone(), events.clone(), invocation, timeout)
        });
    }
}

async fn proxy(
    pending: Arc<PendingToolCalls>,
    events: UnboundedSender<ChatEvent>,
    invocation: ToolInvocation,
    timeout: Duration,
) -> anyhow::Result<String> {
    let call = pending.register(&invocation.name);
    let request = ChatEvent::FrontendToolRequest {
        wait_id: call.wait_id().clone(),
        tool_call_id: invocation.call_id,
        tool_name: invocation.name,
        input: invocation.arguments,
    };
    if events.send(request).is_err() {
        anyhow::bail!("client disconnected before the tool could run");
    }

    let value = call.wait(timeout).await?;
    Ok(match value {
        Value::String(text) => text,
        other => other.to_string(),
    })
}
