// Gemini bridge - OpenAI-compatible proxy in front of the Gemini API

pub mod api;
pub mod config;
pub mod error;
pub mod proxy;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::proxy::credentials::mask_credential;

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::init_config()?;

    let masked: Vec<String> = config
        .gemini_api_keys
        .iter()
        .map(|k| mask_credential(k))
        .collect();
    tracing::info!(
        "Starting with {} API keys {:?} and {} auth tokens",
        masked.len(),
        masked,
        config.auth_tokens.len()
    );
    if config.auth_tokens.is_empty() {
        tracing::warn!("No auth tokens configured, every authenticated route will answer 401");
    }
    if config.allow_unauthenticated_native {
        tracing::warn!("allow-unauthenticated-native is on: native generateContent accepts requests without a token");
    }

    let state = api::AppState::new(config);
    api::start_server(state).await
}
