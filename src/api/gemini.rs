// Upstream generative-language API client

use serde_json::Value;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    api_client: String,
    timeout: Duration,
}

/// Transport variant for streaming calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAlt {
    Sse,
    /// `stream_format: "streamable"`
    Json,
}

impl StreamAlt {
    fn as_str(self) -> &'static str {
        match self {
            StreamAlt::Sse => "sse",
            StreamAlt::Json => "json",
        }
    }
}

impl GeminiClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            api_client: config.api_client.clone(),
            timeout: config.request_timeout(),
        }
    }

    /// Shared HTTP client, also used to download images referenced by requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn generate_url(&self, model: &str, stream: Option<StreamAlt>) -> String {
        match stream {
            Some(alt) => format!(
                "{}/{}/models/{}:streamGenerateContent?alt={}",
                self.base_url,
                self.api_version,
                model,
                alt.as_str()
            ),
            None => format!(
                "{}/{}/models/{}:generateContent",
                self.base_url, self.api_version, model
            ),
        }
    }

    /// Call `generateContent` or `streamGenerateContent`. The response is
    /// returned unread so streaming callers can forward the body.
    pub async fn generate_content(
        &self,
        model: &str,
        stream: Option<StreamAlt>,
        api_key: &str,
        payload: &Value,
    ) -> ProxyResult<reqwest::Response> {
        let url = self.generate_url(model, stream);
        tracing::debug!("Upstream request: POST {}", url);

        let request = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .header("x-goog-api-client", &self.api_client)
            .header("Content-Type", "application/json")
            .json(payload);
        self.send(request).await
    }

    pub async fn list_models(&self, api_key: &str) -> ProxyResult<Value> {
        let url = format!("{}/{}/models", self.base_url, self.api_version);

        let request = self
            .http
            .get(&url)
            .header("x-goog-api-key", api_key)
            .header("x-goog-api-client", &self.api_client);
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    /// `model` carries its `models/` prefix.
    pub async fn batch_embed_contents(
        &self,
        model: &str,
        api_key: &str,
        payload: &Value,
    ) -> ProxyResult<Value> {
        let url = format!(
            "{}/{}/{}:batchEmbedContents",
            self.base_url, self.api_version, model
        );

        let request = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
            .header("x-goog-api-client", &self.api_client)
            .header("Content-Type", "application/json")
            .json(payload);
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    // Bounded by the configured timeout up to the response head; non-2xx
    // becomes an upstream error carrying the body text.
    async fn send(&self, request: reqwest::RequestBuilder) -> ProxyResult<reqwest::Response> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProxyError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!("Upstream responded {}: {}", status, message);
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(&UpstreamConfig {
            base_url: "https://upstream.test/".to_string(),
            ..UpstreamConfig::default()
        })
    }

    #[test]
    fn generate_urls() {
        let c = client();
        assert_eq!(
            c.generate_url("gemini-2.5-pro", None),
            "https://upstream.test/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            c.generate_url("gemini-2.5-pro", Some(StreamAlt::Sse)),
            "https://upstream.test/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            c.generate_url("gemini-2.5-pro", Some(StreamAlt::Json)),
            "https://upstream.test/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=json"
        );
    }
}
