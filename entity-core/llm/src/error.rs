use thiserror::Error;

/// Failures of model resolution and fallback chains
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no usable model for '{0}'")]
    ModelUnavailable(String),

    #[error("all {} models failed: {}", .0.len(), .0.join("; "))]
    AllModelsFailed(Vec<String>),
}
