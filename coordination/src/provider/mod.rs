//! Text-generation providers
//!
//! One [`TextGenerationProvider`] implementation per wire-protocol family.
//! The [`ProviderRegistry`](crate::registry::ProviderRegistry) maps provider
//! identities onto instances built here.
//!
//! ```text
//! Family            | Endpoint                                  | Text path
//! ------------------|-------------------------------------------|-------------------------------
//! anthropic         | POST {base}/v1/messages                   | content[0].text
//! openai            | POST {base}/chat/completions              | choices[0].message.content
//! gemini            | POST {base}/v1beta/models/{m}:generateContent | candidates[0].content.parts[0].text
//! ```

pub mod anthropic;
pub mod error;
pub mod gemini;
mod http;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::registry::{ConfigError, ProviderConfig};

pub use anthropic::AnthropicProvider;
pub use error::{ProviderError, RetryCategory};
pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatibleProvider;

/// Wire-protocol family spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    /// Anthropic messages API.
    Anthropic,
    /// OpenAI-style chat completions (DeepSeek, Moonshot, Qwen, GLM, OpenRouter, ...).
    #[serde(rename = "openai", alias = "openai_compatible")]
    OpenAi,
    /// Google generateContent API.
    Gemini,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Caller-level request: what to say, independent of which provider says it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl TextRequest {
    /// Single user turn.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            messages: vec![ChatMessage::user(text)],
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Bind this request to a concrete model and sampling parameters.
    pub fn for_model(
        &self,
        model: &str,
        params: &GenerationParams,
        timeout: Duration,
    ) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            timeout,
        }
    }
}

/// Sampling parameters attached to a routed call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Provider-level request, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Capability shared by every remote text-generation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextGenerationProvider: Send + Sync {
    /// Wire family this implementation speaks.
    fn protocol(&self) -> WireProtocol;

    /// Produce text for the request, or a classified failure.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Shared handle to a provider implementation.
pub type SharedProvider = Arc<dyn TextGenerationProvider>;

/// Build the wire implementation matching `config.protocol`.
pub fn build_provider(config: &ProviderConfig) -> Result<SharedProvider, ConfigError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
    let api_key = config.api_key.clone().unwrap_or_default();

    let provider: SharedProvider = match config.protocol {
        WireProtocol::Anthropic => Arc::new(AnthropicProvider::new(
            &config.id,
            &config.base_url,
            api_key,
            client,
        )),
        WireProtocol::OpenAi => Arc::new(OpenAiCompatibleProvider::new(
            &config.id,
            &config.base_url,
            api_key,
            client,
        )),
        WireProtocol::Gemini => Arc::new(GeminiProvider::new(
            &config.id,
            &config.base_url,
            api_key,
            client,
        )),
    };
    Ok(provider)
}
