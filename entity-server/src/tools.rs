//! Tools executed by the server itself during a chat turn
//!
//! `currentTime` is always available. `findObjects` and `countObjects` are
//! installed only when a data source is attached to the server.

use chrono::Utc;
use entity_core::{EntityDataSource, EntityQuery};
use llm::{ToolDefinition, ToolInvocation, ToolRegistry};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const CURRENT_TIME: &str = "currentTime";
pub const FIND_OBJECTS: &str = "findObjects";
pub const COUNT_OBJECTS: &str = "countObjects";

/// Page size used when the model does not ask for one
const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CurrentTimeInput {}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectQueryInput {
    /// Name of the model to query, e.g. "product"
    pub model_name: String,
    /// Query envelope: {filter, sortBy, pageIndex, pageSize}. The filter is a
    /// tree of {and|or|not: [...]} composites and {field, operator, value} leaves.
    #[serde(default)]
    pub query: Option<Value>,
}

impl ObjectQueryInput {
    fn entity_query(&self) -> anyhow::Result<EntityQuery> {
        Ok(match &self.query {
            Some(query) => serde_json::from_value(query.clone())?,
            None => EntityQuery::new(),
        })
    }
}

pub fn server_tool_definitions(with_data: bool) -> Vec<ToolDefinition> {
    let mut definitions = vec![ToolDefinition::for_input::<CurrentTimeInput>(
        CURRENT_TIME,
        "Get the current date and time in UTC (RFC 3339)",
    )];
    if with_data {
        definitions.push(ToolDefinition::for_input::<ObjectQueryInput>(
            FIND_OBJECTS,
            "Find objects of a model matching a filter. Returns {data, count} where \
             count is the total number of matches before paging.",
        ));
        definitions.push(ToolDefinition::for_input::<ObjectQueryInput>(
            COUNT_OBJECTS,
            "Count objects of a model matching a filter",
        ));
    }
    definitions
}

/// Install the server-executed tools into `registry`
pub fn register_server_tools(
    registry: &mut ToolRegistry,
    data_source: Option<Arc<dyn EntityDataSource>>,
) {
    for definition in server_tool_definitions(data_source.is_some()) {
        match definition.name.as_str() {
            CURRENT_TIME => registry.register(definition, |_| async {
                Ok(Utc::now().to_rfc3339())
            }),
            FIND_OBJECTS | COUNT_OBJECTS => {
                if let Some(source) = &data_source {
                    let source = source.clone();
                    registry.register(definition, move |invocation| {
                        query_objects(source.clone(), invocation)
                    });
                }
            }
            _ => {}
        }
    }
}

async fn query_objects(
    source: Arc<dyn EntityDataSource>,
    invocation: ToolInvocation,
) -> anyhow::Result<String> {
    let input: ObjectQueryInput = serde_json::from_value(invocation.arguments)?;
    let mut query = input.entity_query()?;
    tracing::debug!(tool = %invocation.name, model = %input.model_name, "Querying objects");

    if invocation.name == COUNT_OBJECTS {
        let count = source.find_count(&input.model_name, &query).await?;
        return Ok(json!({ "count": count }).to_string());
    }

    if query.page_size.is_none() {
        query.page_size = Some(DEFAULT_PAGE_SIZE);
        query.page_index = Some(query.page_index.unwrap_or(1));
    }
    let page = source.find_many(&input.model_name, &query).await?;
    Ok(serde_json::to_string(&page)?)
}
