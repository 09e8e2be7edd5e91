use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, CompletionOptions, LlmError, LlmProvider};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
}

/// Any chat-completions endpoint speaking the OpenAI wire format.
pub struct GenericProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl GenericProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let req = OpenAiRequest {
            model: model_id,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        };

        let mut request = self.client.post(self.endpoint()).json(&req);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let res = request
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: self.id.clone(),
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        let parsed: OpenAiResponse = res
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Response("no choices in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_normalized() {
        let p = GenericProvider::new("x", "https://api.example.com/v1/", None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(p.endpoint(), "https://api.example.com/v1/chat/completions");
        let p = GenericProvider::new(
            "x",
            "https://api.example.com/v1/chat/completions",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(p.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let p = GenericProvider::new("x", "http://127.0.0.1:9/v1", None, Duration::from_secs(2)).unwrap();
        let err = p
            .generate("m", &[ChatMessage::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fallback_eligible(), "{err}");
    }

    #[test]
    fn request_omits_unset_options() {
        let req = OpenAiRequest {
            model: "m",
            messages: vec![OpenAiMessage {
                role: "user",
                content: "hi",
            }],
            temperature: None,
            max_tokens: Some(10),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("temperature").is_none());
        assert_eq!(v["max_tokens"], 10);
    }
}
