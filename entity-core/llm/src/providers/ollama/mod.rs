pub(crate) mod chat;
pub(crate) mod provider;

pub use chat::{OllamaChatModel, OllamaEmbeddingModel};
pub use provider::OllamaProvider;
