//! Narrow seam over the language-model completion service.
//!
//! Three pipeline stages go through here: free-text extraction, the
//! web-search portal agent, and advice synthesis. All of them treat the
//! reply as untrusted text and parse it through `llm_json`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion. `system` sets the role/instruction frame, `prompt`
    /// carries the task payload.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// HTTP client for an Ollama-compatible completion endpoint.
pub struct HttpLlm {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpLlm {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("completion service: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "completion service returned {status}: {body}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("completion response: {e}")))?;

        Ok(parsed.response)
    }
}

/// Scripted client for tests; returns queued replies in order, then the
/// last one forever; or fails every call when constructed unavailable.
pub struct MockLlm {
    replies: std::sync::Mutex<Vec<String>>,
    unavailable: bool,
}

impl MockLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            replies: std::sync::Mutex::new(vec![reply.to_string()]),
            unavailable: false,
        }
    }

    pub fn with_replies(replies: Vec<String>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies),
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            replies: std::sync::Mutex::new(Vec::new()),
            unavailable: true,
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, _system: &str, _prompt: &str) -> Result<String> {
        if self.unavailable {
            return Err(AppError::Upstream("completion service unavailable".into()));
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| AppError::Upstream("mock poisoned".into()))?;
        if replies.len() > 1 {
            Ok(replies.remove(0))
        } else {
            replies
                .first()
                .cloned()
                .ok_or_else(|| AppError::Upstream("mock exhausted".into()))
        }
    }
}
