//! Inference Client
//!
//! Wraps an OpenAI-compatible /v1/chat/completions endpoint. Every stage
//! of a cycle goes through this one client; the prompt builder decides
//! what the model is asked to produce.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::types::{GenerationRequest, Generator};

use super::prompts;

pub struct HttpGenerator {
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    http: Client,
}

impl HttpGenerator {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self {
            api_url,
            api_key,
            model,
            max_tokens,
            http,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompts::SYSTEM_PROMPT },
                { "role": "user", "content": prompts::user_prompt(request) },
            ],
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        debug!(
            "Requesting {} generation (request {}, regen attempt {:?})",
            request.kind.as_str(),
            request.id,
            request.regen.as_ref().map(|r| r.attempt)
        );

        let url = format!("{}/v1/chat/completions", self.api_url);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Inference request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Inference error: {}: {}", status.as_u16(), text);
        }

        let data: Value = resp
            .json()
            .await
            .context("Failed to parse inference response")?;

        let content = data["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow::anyhow!("No completion choice returned from inference"))?;

        Ok(content.to_string())
    }
}
