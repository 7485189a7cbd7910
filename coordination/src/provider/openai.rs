//! OpenAI-compatible chat completions.
//!
//! Most hosted models (DeepSeek, Moonshot/Kimi, Qwen, GLM, OpenRouter) speak
//! this dialect, so one implementation covers them all.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{extract_text, join_url, send_json};
use super::{GenerationRequest, ProviderError, TextGenerationProvider, WireProtocol};

pub struct OpenAiCompatibleProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: &str, base_url: &str, api_key: String, client: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            api_key,
            client,
        }
    }

    fn body(request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(
            request
                .messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
        );

        json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl TextGenerationProvider for OpenAiCompatibleProvider {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::OpenAi
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let builder = self
            .client
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&Self::body(request));

        let body = send_json(&self.id, builder, request.timeout).await?;
        extract_text(&self.id, &body, "/choices/0/message/content")
    }
}
