//! Entity Engine HTTP server
//!
//! Serves the AI endpoints used by the entity views:
//! - `POST /chat` - multi-step tool loop, streamed as server-sent events
//! - `POST /completion` - single prompt, streamed text
//! - `POST /object` - structured JSON answer, streamed then parsed
//! - `POST /embeddings` - OpenAI-style embeddings list
//! - `POST /frontend-tool-result` - results of tools run in the browser
//! - `GET /health` - provider health and pending tool calls
//!
//! All routes are mounted under `server.base_path` and answer CORS pre-flights.

pub mod logging;
pub mod response;
pub mod routes;
pub mod tools;

use engine_config::EngineSettings;
use entity_core::{EntityDataSource, PendingToolCalls};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use llm::{ChatModel, ProviderRegistry};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use crate::response::ApiError;

/// Shared state handed to every request
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub data_source: Option<Arc<dyn EntityDataSource>>,
    /// Frontend tool calls waiting for `/frontend-tool-result`
    pub pending: Arc<PendingToolCalls>,
    pub settings: EngineSettings,
}

impl AppState {
    pub fn new(registry: Arc<ProviderRegistry>, settings: EngineSettings) -> Self {
        AppState {
            registry,
            data_source: None,
            pending: Arc::new(PendingToolCalls::new()),
            settings,
        }
    }

    pub fn with_data_source(mut self, data_source: Arc<dyn EntityDataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.ai.tool_timeout_secs.max(1))
    }

    fn base_path(&self) -> &str {
        self.settings.server.base_path.trim_end_matches('/')
    }

    /// Path relative to the base path, `None` when outside it
    pub fn route_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.base_path())?;
        if rest.starts_with('/') { Some(rest) } else { None }
    }

    /// Requested (or default) model followed by the configured fallbacks
    pub fn model_chain(
        &self,
        requested: Option<&str>,
    ) -> Result<Arc<dyn ChatModel + Send + Sync>, ApiError> {
        let chain = self
            .registry
            .create_model_chain(requested, &self.settings.ai.fallback_models)?;
        Ok(Arc::new(chain))
    }
}

/// Handle to a running server that can be used to stop it
pub struct ServerHandle {
    shutdown_tx: oneshot::Sender<()>,
    port: u16,
    base_path: String,
}

impl ServerHandle {
    /// Get the port the server is running on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the base URL every endpoint is mounted under
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.base_path)
    }

    /// Stop the server
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Start the server on a random local port
pub async fn start_server(state: AppState) -> anyhow::Result<ServerHandle> {
    start_server_on("127.0.0.1", 0, state).await
}

/// Start the server on the specified host and port
pub async fn start_server_on(
    host: &str,
    port: u16,
    state: AppState,
) -> anyhow::Result<ServerHandle> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let actual_port = local_addr.port();
    let base_path = state.base_path().to_string();

    info!("Starting entity server on {}{}", local_addr, base_path);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let state = Arc::new(state);

    tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        // Entries outlive their waiter only when a result never arrives
        let max_age = state.tool_timeout() * 2;
        let mut sweep = tokio::time::interval(max_age);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutting down entity server");
                    break;
                }
                _ = sweep.tick() => {
                    let removed = state.pending.sweep_expired(max_age);
                    if removed > 0 {
                        tracing::warn!("Swept {} abandoned frontend tool calls", removed);
                    }
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let io = TokioIo::new(stream);
                            let state = state.clone();

                            tokio::spawn(async move {
                                if let Err(err) = http1::Builder::new()
                                    .serve_connection(
                                        io,
                                        hyper::service::service_fn(move |req| {
                                            let state = state.clone();
                                            async move {
                                                Ok::<_, Infallible>(routes::handle(state, req).await)
                                            }
                                        }),
                                    )
                                    .await
                                {
                                    tracing::error!("Error serving connection: {:?}", err);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    });

    Ok(ServerHandle {
        shutdown_tx,
        port: actual_port,
        base_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_base(base_path: &str) -> AppState {
        let mut settings = EngineSettings::default();
        settings.server.base_path = base_path.to_string();
        AppState::new(Arc::new(ProviderRegistry::new()), settings)
    }

    #[test]
    fn test_route_path_respects_base_path() {
        let state = state_with_base("/api/ee/");
        assert_eq!(state.route_path("/api/ee/chat"), Some("/chat"));
        assert_eq!(state.route_path("/api/eechat"), None);
        assert_eq!(state.route_path("/chat"), None);

        let root = state_with_base("");
        assert_eq!(root.route_path("/chat"), Some("/chat"));
    }

    #[test]
    fn test_model_chain_without_providers_is_unavailable() {
        let state = state_with_base("");
        match state.model_chain(None) {
            Err(ApiError::ModelUnavailable(_)) => {}
            _ => panic!("expected ModelUnavailable"),
        }
    }
}
