pub(crate) mod chat;
mod embeddings;
pub(crate) mod provider;

pub use chat::OpenAIChatModel;
pub use embeddings::OpenAIEmbeddingModel;
pub use provider::OpenAIProvider;
