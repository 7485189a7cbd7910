//! Google Gemini generateContent.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{extract_text, join_url, send_json};
use super::{GenerationRequest, ProviderError, Role, TextGenerationProvider, WireProtocol};

pub struct GeminiProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(id: &str, base_url: &str, api_key: String, client: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.to_string(),
            api_key,
            client,
        }
    }

    fn body(request: &GenerationRequest) -> Value {
        // Gemini names the assistant role "model".
        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            }
        });
        if let Some(system) = &request.system_prompt {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }
}

#[async_trait]
impl TextGenerationProvider for GeminiProvider {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Gemini
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let path = format!("v1beta/models/{}:generateContent", request.model);
        let builder = self
            .client
            .post(join_url(&self.base_url, &path))
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::body(request));

        let body = send_json(&self.id, builder, request.timeout).await?;
        extract_text(&self.id, &body, "/candidates/0/content/parts/0/text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use std::time::Duration;

    #[test]
    fn test_body_maps_roles_and_generation_config() {
        let request = GenerationRequest {
            model: "gemini-2.0-flash-exp".to_string(),
            system_prompt: Some("sys".to_string()),
            messages: vec![ChatMessage::user("q"), ChatMessage::assistant("a")],
            max_tokens: 2048,
            temperature: 0.7,
            timeout: Duration::from_secs(1),
        };
        let body = GeminiProvider::body(&request);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }
}
