//! Core of the entity engine
//!
//! This crate provides:
//! - **Model**: `EntityObject`, `EntityObjectReference`, `EntityModel` and `PlainConfig`
//! - **Query**: filter trees (`QueryItem`), the `EntityQuery` envelope and `GroupedQuery`
//! - **Storage**: `EntityDataSource` over `MemoryDataSource` and `SqliteDataSource` backends
//! - **Bridge**: correlation of frontend-proxied tool calls with their browser-side results
//! - **Agent**: `ToolLoop`, the multi-step tool-calling loop, and its `ChatEvent` stream
//!
//! # Example
//!
//! ```ignore
//! use entity_core::{EntityDataSource, EntityQuery, MemoryDataSource, Operator, QueryItem};
//!
//! let source = MemoryDataSource::new();
//! let query = EntityQuery::new()
//!     .with_filter(QueryItem::condition("stock", Operator::Lte, json!(0))?);
//! let page = source.find_many("product", &query).await?;
//! ```
pub mod agent;
pub mod bridge;
pub mod error;
pub mod ids;
pub mod model;
pub mod query;
pub mod sanitize;
pub mod storage;

pub use agent::{ChatEvent, DEFAULT_MAX_STEPS, FinishReason, ToolLoop};
pub use bridge::{
    BridgeHandle, FrontendToolExecutor, FrontendToolInterceptor, PendingToolCalls,
    ToolResultClient, ToolResultPayload, ViewController, register_frontend_tools,
};
pub use error::{EngineError, Result};
pub use ids::{ObjectId, ReferenceId, WaitId};
pub use model::{
    EntityModel, EntityObject, EntityObjectReference, FieldDefinition, FieldType, PlainConfig,
    ReferenceScope, ValidationReport, Values,
};
pub use query::{
    EntityQuery, GroupSpec, GroupedQuery, GroupedResult, Operator, Page, QueryItem, SortBy,
    SortOrder,
};
pub use sanitize::{ErrorCategory, SanitizedError, sanitize_error};
pub use storage::{
    ConfigStore, DeleteMode, EntityDataSource, MemoryDataSource, ObjectStore,
    ObjectWithReferences, ReferenceStore, TreeNode,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteDataSource;
