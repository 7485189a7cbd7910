//! Anthropic messages API.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{extract_text, join_url, send_json};
use super::{GenerationRequest, ProviderError, TextGenerationProvider, WireProtocol};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(id: &str, base_url: &str, api_key: String, client: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            api_key,
            client,
        }
    }

    fn body(request: &GenerationRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

#[async_trait]
impl TextGenerationProvider for AnthropicProvider {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Anthropic
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let builder = self
            .client
            .post(join_url(&self.base_url, "v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&Self::body(request));

        let body = send_json(&self.id, builder, request.timeout).await?;
        extract_text(&self.id, &body, "/content/0/text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use std::time::Duration;

    #[test]
    fn test_body_carries_system_and_messages() {
        let request = GenerationRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            system_prompt: Some("sys".to_string()),
            messages: vec![ChatMessage::user("q"), ChatMessage::assistant("a")],
            max_tokens: 512,
            temperature: 0.5,
            timeout: Duration::from_secs(1),
        };
        let body = AnthropicProvider::body(&request);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][1]["role"], "assistant");
    }

    #[test]
    fn test_body_omits_absent_system() {
        let request = GenerationRequest {
            model: "m".to_string(),
            system_prompt: None,
            messages: vec![ChatMessage::user("q")],
            max_tokens: 1,
            temperature: 0.0,
            timeout: Duration::from_secs(1),
        };
        assert!(AnthropicProvider::body(&request).get("system").is_none());
    }
}
