//! Error taxonomy shared by the data-source layer and the tool bridge

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed filter tree or request shape
    #[error("validation error: {0}")]
    Validation(String),

    /// Bad pagination, unknown operator, unknown reference field
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Aggregation over a value of the wrong kind
    #[error("type error: {0}")]
    Type(String),

    #[error("tool call {wait_id} timed out after {seconds}s")]
    ToolTimeout { wait_id: String, seconds: u64 },

    #[error("tool call {0} was cancelled")]
    ToolCancelled(String),

    #[error("tool call failed: {0}")]
    ToolFailed(String),

    /// The event receiver went away mid-run
    #[error("event stream closed by the client")]
    StreamClosed,

    #[error("no usable model: {0}")]
    ModelUnavailable(String),

    /// Field names a frontend tool does not know about
    #[error("invalid field names: {}. Valid field names are: {}", invalid.join(", "), valid.join(", "))]
    ToolNameInvalid {
        invalid: Vec<String>,
        valid: Vec<String>,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(e.into())
    }
}

#[cfg(feature = "rusqlite")]
impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.into())
    }
}

impl From<llm::LlmError> for EngineError {
    fn from(e: llm::LlmError) -> Self {
        match e {
            llm::LlmError::ModelUnavailable(id) => EngineError::ModelUnavailable(id),
            other => EngineError::Storage(other.into()),
        }
    }
}
