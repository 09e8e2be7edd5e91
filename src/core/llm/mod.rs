pub mod generic_provider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} API error ({status}): {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Response(String),
}

impl LlmError {
    /// Rate limiting, server-side failures and transport errors may succeed
    /// on another model; client errors will not.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => *status >= 429,
            LlmError::Transport(_) => true,
            LlmError::Response(_) => false,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<String, LlmError>;
}

/// Model selection plus the single-retry fallback policy.
#[derive(Clone)]
pub struct LlmManager {
    provider: Arc<dyn LlmProvider>,
    model: String,
    fallback_model: Option<String>,
}

impl LlmManager {
    pub fn new(provider: Arc<dyn LlmProvider>, model: String, fallback_model: Option<String>) -> Self {
        info!(
            "LLM provider {} (model: {}, fallback: {})",
            provider.provider_id(),
            model,
            fallback_model.as_deref().unwrap_or("none")
        );
        Self {
            provider,
            model,
            fallback_model,
        }
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.complete_with(&self.model, self.fallback_model.as_deref(), messages, opts)
            .await
    }

    /// Try `model`; on a fallback-eligible error retry once on a distinct
    /// `fallback`.
    pub async fn complete_with(
        &self,
        model: &str,
        fallback: Option<&str>,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<String, LlmError> {
        match self.provider.generate(model, messages, opts).await {
            Ok(text) => Ok(text),
            Err(e) => match fallback {
                Some(fb) if fb != model && e.is_fallback_eligible() => {
                    warn!("LLM {} failed ({}); retrying on {}", model, e, fb);
                    self.provider.generate(fb, messages, opts).await
                }
                _ => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Flaky {
        fail_with: Option<u16>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn provider_id(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _opts: &CompletionOptions,
        ) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(model_id.to_string());
            match self.fail_with {
                Some(status) if model_id == "primary" => Err(LlmError::Status {
                    provider: "flaky".into(),
                    status,
                    body: String::new(),
                }),
                _ => Ok(format!("from {model_id}")),
            }
        }
    }

    fn manager(fail_with: Option<u16>, fallback: Option<&str>) -> (LlmManager, Arc<Flaky>) {
        let provider = Arc::new(Flaky {
            fail_with,
            calls: Mutex::new(Vec::new()),
        });
        let mgr = LlmManager::new(provider.clone(), "primary".into(), fallback.map(String::from));
        (mgr, provider)
    }

    #[tokio::test]
    async fn falls_back_once_on_rate_limit() {
        let (mgr, provider) = manager(Some(429), Some("backup"));
        let out = mgr.complete(&[ChatMessage::user("hi")], &CompletionOptions::default()).await;
        assert_eq!(out.unwrap(), "from backup");
        assert_eq!(*provider.calls.lock().unwrap(), vec!["primary", "backup"]);
    }

    #[tokio::test]
    async fn client_errors_do_not_fall_back() {
        let (mgr, provider) = manager(Some(400), Some("backup"));
        let out = mgr.complete(&[ChatMessage::user("hi")], &CompletionOptions::default()).await;
        assert!(matches!(out, Err(LlmError::Status { status: 400, .. })));
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_model_fallback_is_ignored() {
        let (mgr, provider) = manager(Some(503), Some("primary"));
        assert!(mgr
            .complete(&[ChatMessage::user("hi")], &CompletionOptions::default())
            .await
            .is_err());
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn transport_errors_are_eligible() {
        assert!(LlmError::Transport("reset".into()).is_fallback_eligible());
        assert!(!LlmError::Response("bad json".into()).is_fallback_eligible());
    }
}
