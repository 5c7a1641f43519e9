// Configuration module for the Gemini bridge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "GEMINI_BRIDGE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Initial upstream key pool.
    #[serde(default)]
    pub gemini_api_keys: Vec<String>,

    /// Initial bearer-token allow-list.
    #[serde(default)]
    pub auth_tokens: Vec<String>,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_embeddings_model")]
    pub default_embeddings_model: String,

    /// Lets `/v1beta/models/{model}:generateContent` through without a bearer
    /// token, drawing an upstream key directly. Off unless explicitly enabled.
    #[serde(default)]
    pub allow_unauthenticated_native: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gemini_api_keys: Vec::new(),
            auth_tokens: Vec::new(),
            upstream: UpstreamConfig::default(),
            default_model: default_model(),
            default_embeddings_model: default_embeddings_model(),
            allow_unauthenticated_native: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_embeddings_model() -> String {
    "text-embedding-004".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_api_client")]
    pub api_client: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            api_client: default_api_client(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_api_version() -> String {
    "v1beta".to_string()
}

fn default_api_client() -> String {
    "genai-js/0.21.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Resolve the config file location: `$GEMINI_BRIDGE_CONFIG`, else the
/// platform config dir.
pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gemini-bridge")
        .join("config.yaml")
}

/// Read the YAML config at `path`, writing a default one if it does not exist.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        tracing::info!("Config loaded from {:?}", path);
        return Ok(config);
    }

    let config = AppConfig::default();
    if let Err(e) = write_default(path, &config) {
        tracing::warn!("Could not write default config to {:?}: {}", path, e);
    } else {
        tracing::info!("Default config written to {:?}", path);
    }
    Ok(config)
}

fn write_default(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}

/// Apply `GEMINI_API_KEYS`, `AUTH_TOKENS`, `HOST` and `PORT` on top of the file.
pub fn apply_env_overrides(config: &mut AppConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(keys) = lookup("GEMINI_API_KEYS") {
        config.gemini_api_keys = split_list(&keys);
        tracing::info!(
            "Loaded {} API keys from GEMINI_API_KEYS",
            config.gemini_api_keys.len()
        );
    }
    if let Some(tokens) = lookup("AUTH_TOKENS") {
        config.auth_tokens = split_list(&tokens);
        tracing::info!("Loaded {} auth tokens from AUTH_TOKENS", config.auth_tokens.len());
    }
    if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
        config.host = host.trim().to_string();
    }
    if let Some(port) = lookup("PORT") {
        match port.trim().parse() {
            Ok(p) => config.port = p,
            Err(_) => tracing::warn!("Ignoring invalid PORT value {:?}", port),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Load the file at the resolved path and layer the environment on top.
pub fn init_config() -> Result<AppConfig> {
    let path = resolve_config_path();
    let mut config = load_config(&path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(
            "port: 9000\ngemini-api-keys: [k1, k2]\nupstream:\n  request-timeout-secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.gemini_api_keys, vec!["k1", "k2"]);
        assert_eq!(config.upstream.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.upstream.api_version, "v1beta");
        assert_eq!(config.default_model, "gemini-2.5-pro");
        assert!(!config.allow_unauthenticated_native);
    }

    #[test]
    fn env_lists_are_trimmed_and_filtered() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEYS", " a , ,b,"),
            ("AUTH_TOKENS", "t1"),
            ("PORT", "not-a-port"),
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.gemini_api_keys, vec!["a", "b"]);
        assert_eq!(config.auth_tokens, vec!["t1"]);
        assert_eq!(config.port, 8000);
    }
}
