//! OpenAI-style HTTP endpoint implementation
//!
//! Supports the standard OpenAI deployment and Azure-flavoured deployments
//! (which authenticate with an `api-key` header, carry an `api-version`
//! query parameter, and expect `engine` instead of `model` in the body).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{CompletionEndpoint, EndpointError, Flavor, ResponseRecord};
use crate::JsonMap;

/// Default OpenAI API base URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Deployment flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiType {
    #[default]
    OpenAi,
    Azure,
}

/// Configuration for the OpenAI endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_type: ApiType,
    /// Required query parameter for Azure deployments.
    pub api_version: Option<String>,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: OPENAI_API_URL.to_string(),
            api_type: ApiType::OpenAi,
            api_version: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl OpenAiConfig {
    /// Config for an Azure deployment rooted at `base_url`.
    pub fn azure(base_url: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_type: ApiType::Azure,
            api_version: Some(api_version.into()),
            ..Default::default()
        }
    }
}

/// OpenAI-compatible completion endpoint.
pub struct OpenAiEndpoint {
    client: Client,
    api_key: String,
    config: OpenAiConfig,
}

impl OpenAiEndpoint {
    /// Create a new endpoint, reading OPENAI_API_KEY from the environment.
    pub fn new(config: OpenAiConfig) -> Result<Self, EndpointError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EndpointError::InvalidRequest("OPENAI_API_KEY not set".to_string()))?;
        Self::with_api_key(api_key, config)
    }

    /// Create an endpoint with an explicit API key.
    pub fn with_api_key(api_key: String, config: OpenAiConfig) -> Result<Self, EndpointError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EndpointError::Connection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, api_key, config })
    }

    fn url(&self, flavor: Flavor) -> String {
        let path = match flavor {
            Flavor::Plain => "completions",
            Flavor::Chat => "chat/completions",
        };
        match &self.config.api_version {
            Some(version) => {
                format!("{}/{path}?api-version={version}", self.config.base_url)
            }
            None => format!("{}/{path}", self.config.base_url),
        }
    }
}

#[async_trait]
impl CompletionEndpoint for OpenAiEndpoint {
    async fn complete(
        &self,
        params: &JsonMap,
        flavor: Flavor,
    ) -> Result<ResponseRecord, EndpointError> {
        let mut request = self.client.post(self.url(flavor)).json(params);
        request = match self.config.api_type {
            ApiType::OpenAi => request.bearer_auth(&self.api_key),
            ApiType::Azure => request.header("api-key", &self.api_key),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EndpointError::Timeout(e.to_string())
            } else {
                EndpointError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(match status.as_u16() {
                429 => EndpointError::RateLimited(body),
                503 => EndpointError::ServiceUnavailable(body),
                400..=499 => EndpointError::InvalidRequest(body),
                code => EndpointError::Api { status: code, message: body },
            });
        }

        response
            .json()
            .await
            .map_err(|e| EndpointError::InvalidResponse(e.to_string()))
    }

    fn requires_engine_param(&self) -> bool {
        self.config.api_type == ApiType::Azure
    }
}

impl std::fmt::Debug for OpenAiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEndpoint")
            .field("base_url", &self.config.base_url)
            .field("api_type", &self.config.api_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(config: OpenAiConfig) -> OpenAiEndpoint {
        OpenAiEndpoint::with_api_key("test-key".to_string(), config).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = OpenAiConfig::default();
        assert_eq!(config.base_url, OPENAI_API_URL);
        assert_eq!(config.api_type, ApiType::OpenAi);
        assert!(config.api_version.is_none());
    }

    #[test]
    fn test_plain_url() {
        let ep = endpoint(OpenAiConfig::default());
        assert_eq!(ep.url(Flavor::Plain), "https://api.openai.com/v1/completions");
    }

    #[test]
    fn test_chat_url() {
        let ep = endpoint(OpenAiConfig::default());
        assert_eq!(ep.url(Flavor::Chat), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_azure_url_carries_api_version() {
        let ep = endpoint(OpenAiConfig::azure("https://example.azure.com/openai", "2023-05-15"));
        assert_eq!(
            ep.url(Flavor::Plain),
            "https://example.azure.com/openai/completions?api-version=2023-05-15"
        );
    }

    #[test]
    fn test_azure_requires_engine_param() {
        let ep = endpoint(OpenAiConfig::azure("https://x", "v"));
        assert!(ep.requires_engine_param());

        let ep = endpoint(OpenAiConfig::default());
        assert!(!ep.requires_engine_param());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let ep = endpoint(OpenAiConfig::default());
        let debug = format!("{ep:?}");
        assert!(debug.contains("OpenAiEndpoint"));
        assert!(!debug.contains("test-key"));
    }
}
