//! Threat Intelligence Retrieval
//!
//! Thin client for the retrieval service that serves indexed threat
//! intelligence. Retrieval is advisory: callers treat a failure here as a
//! degraded cycle, not a fatal one.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::types::{Passage, Retriever};

pub struct HttpRetriever {
    base_url: String,
    http: Client,
}

impl HttpRetriever {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build retrieval HTTP client")?;
        Ok(Self { base_url, http })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        let url = format!(
            "{}/retrieve?query={}&top_k={}",
            self.base_url,
            urlencoding::encode(query),
            top_k
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Retrieval request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Retrieval error: {}", status.as_u16());
        }

        let data: Value = resp
            .json()
            .await
            .context("Failed to parse retrieval response")?;

        let passages = data["passages"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let text = item["text"].as_str()?.to_string();
                        Some(Passage {
                            text,
                            score: item["score"].as_f64().unwrap_or(0.0),
                            source: item["source"].as_str().map(|s| s.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(passages)
    }
}
