use crate::api::ToolDefinition;
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// A single tool call as seen by a handler
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    /// Provider-assigned id of the tool call
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

type ToolFn = Box<
    dyn Fn(ToolInvocation) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync,
>;

pub struct ToolRegistry {
    tools: BTreeMap<String, (ToolDefinition, ToolFn)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: BTreeMap::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let name = definition.name.clone();
        let wrapped: ToolFn = Box::new(move |invocation| Box::pin(handler(invocation)));
        self.tools.insert(name, (definition, wrapped));
    }

    pub fn get_definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|(def, _)| def)
    }

    /// All definitions, ordered by tool name
    pub fn get_all_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|(def, _)| def.clone()).collect()
    }

    pub async fn call(&self, invocation: ToolInvocation) -> Result<String> {
        match self.tools.get(&invocation.name) {
            Some((_, handler)) => handler(invocation).await,
            None => Err(anyhow::anyhow!("Tool '{}' not found", invocation.name)),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
