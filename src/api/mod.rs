// HTTP API Server module

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod handlers;
pub mod gemini;
pub mod management;
pub mod streaming;

use crate::config::AppConfig;
use crate::proxy::credentials::CredentialStore;
use gemini::GeminiClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub credentials: Arc<CredentialStore>,
    pub gemini: GeminiClient,
}

impl AppState {
    /// Seed the credential pools and upstream client from `config`.
    pub fn new(config: AppConfig) -> Self {
        let credentials = CredentialStore::new(
            config.gemini_api_keys.iter().cloned(),
            config.auth_tokens.iter().cloned(),
        );
        let gemini = GeminiClient::new(&config.upstream);
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            gemini,
        }
    }
}

/// Every path goes through one dispatcher; the route classifier decides what
/// it means.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .fallback(handlers::dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

pub async fn start_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("API server stopping");
        })
        .await?;

    Ok(())
}
