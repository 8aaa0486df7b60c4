//! Remote completion endpoint layer
//!
//! This module provides:
//! - Response and token-usage types shared by all endpoints
//! - The CompletionEndpoint trait for API abstraction
//! - A reqwest-backed implementation for OpenAI-style deployments
//! - A scriptable mock endpoint for tests

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::JsonMap;

pub use mock::MockEndpoint;
pub use openai::{ApiType, OpenAiConfig, OpenAiEndpoint};

/// Request shape expected by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// `prompt` in, `choices[i].text` out.
    Plain,
    /// `messages` in, `choices[i].message.content` out.
    Chat,
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Message body of a chat choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    pub content: String,
}

/// One generated completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChoiceMessage>,
}

impl Choice {
    /// A plain-completion choice.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), message: None }
    }

    /// A chat choice.
    pub fn chat(content: impl Into<String>) -> Self {
        Self {
            text: None,
            message: Some(ChoiceMessage { content: content.into() }),
        }
    }
}

/// A successful completion response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ResponseRecord {
    pub fn new(choices: Vec<Choice>, usage: Usage) -> Self {
        Self { choices, usage }
    }

    /// The generated strings, right-trimmed, in choice order.
    pub fn texts(&self, flavor: Flavor) -> Vec<String> {
        self.choices
            .iter()
            .map(|c| {
                let raw = match flavor {
                    Flavor::Chat => c.message.as_ref().map(|m| m.content.as_str()),
                    Flavor::Plain => c.text.as_deref(),
                };
                raw.unwrap_or("").trim_end().to_string()
            })
            .collect()
    }
}

/// Errors reported by a completion endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl EndpointError {
    /// Transient errors are retried on a fixed interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_) | Self::Api { .. } | Self::Connection(_)
        )
    }

    /// Throttle errors are retried only within the retry-timeout window.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }
}

/// Remote text-completion API.
#[async_trait]
pub trait CompletionEndpoint: Send + Sync {
    /// Issue one completion call with the given request body.
    async fn complete(
        &self,
        params: &JsonMap,
        flavor: Flavor,
    ) -> std::result::Result<ResponseRecord, EndpointError>;

    /// Whether this deployment expects `engine` instead of `model`.
    fn requires_engine_param(&self) -> bool {
        false
    }
}
