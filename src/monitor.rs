//! Signal Feeds and Escalation
//!
//! Each monitored signal class (market, social, wallet) is polled from an
//! HTTP feed and appended to the notification log. Escalation decides
//! which notifications are serious enough to trigger a full agent cycle;
//! everything else waits in the log for the next cycle's context window.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{MonitoringTarget, Notification, NotificationSource, SignalFeed, TargetKind};

/// Polls one HTTP feed for the events its source class emits.
///
/// Expected response shape: `{"events": [{"target": ..., "summary": ...,
/// "payload": {...}}]}`. Unknown fields are carried through in the payload.
pub struct HttpSignalFeed {
    base_url: String,
    source: NotificationSource,
    http: Client,
}

impl HttpSignalFeed {
    pub fn new(base_url: String, source: NotificationSource, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self {
            base_url,
            source,
            http,
        })
    }

    fn relevant_targets<'a>(&self, targets: &'a [MonitoringTarget]) -> Vec<&'a MonitoringTarget> {
        targets
            .iter()
            .filter(|t| match self.source {
                NotificationSource::Market => t.kind == TargetKind::Token,
                NotificationSource::Wallet => t.kind == TargetKind::Wallet,
                NotificationSource::Social => t.kind == TargetKind::SocialKeyword,
                NotificationSource::Intel => true,
            })
            .collect()
    }
}

#[async_trait]
impl SignalFeed for HttpSignalFeed {
    fn source(&self) -> NotificationSource {
        self.source.clone()
    }

    async fn poll(&self, targets: &[MonitoringTarget]) -> Result<Vec<Notification>> {
        let relevant = self.relevant_targets(targets);
        if relevant.is_empty() {
            return Ok(vec![]);
        }

        let values: Vec<&str> = relevant.iter().map(|t| t.value.as_str()).collect();
        let url = format!(
            "{}/events?source={}&targets={}",
            self.base_url,
            self.source.as_str(),
            urlencoding::encode(&values.join(","))
        );

        let resp = self.http.get(&url).send().await.context("Feed request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Feed error ({}): {}", self.source.as_str(), status.as_u16());
        }

        let data: Value = resp.json().await.context("Failed to parse feed response")?;
        let events = data["events"].as_array().cloned().unwrap_or_default();

        let now = Utc::now().to_rfc3339();
        let notifications = events
            .into_iter()
            .filter_map(|event| {
                let summary = event["summary"].as_str()?.to_string();
                Some(Notification {
                    id: Uuid::new_v4().to_string(),
                    source: self.source.clone(),
                    target: event["target"].as_str().map(|s| s.to_string()),
                    summary,
                    payload: event["payload"].clone(),
                    created_at: now.clone(),
                    consumed_at: None,
                })
            })
            .collect();

        Ok(notifications)
    }
}

// ─── Escalation ──────────────────────────────────────────────────

/// Whether a notification warrants an immediate cycle instead of waiting
/// for the next one.
pub fn should_escalate(
    notification: &Notification,
    price_drop_threshold_pct: f64,
    social_severity_threshold: f64,
) -> bool {
    match notification.source {
        NotificationSource::Market => notification.payload["price_delta_pct"]
            .as_f64()
            .map(|delta| delta <= -price_drop_threshold_pct)
            .unwrap_or(false),
        NotificationSource::Wallet => notification.payload["suspicious"]
            .as_bool()
            .unwrap_or(false),
        NotificationSource::Social => notification.payload["severity"]
            .as_f64()
            .map(|s| s >= social_severity_threshold)
            .unwrap_or(false),
        NotificationSource::Intel => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(source: NotificationSource, payload: Value) -> Notification {
        Notification {
            id: Uuid::new_v4().to_string(),
            source,
            target: Some("SOL".to_string()),
            summary: "test event".to_string(),
            payload,
            created_at: Utc::now().to_rfc3339(),
            consumed_at: None,
        }
    }

    #[test]
    fn test_market_escalates_on_drop_past_threshold() {
        let n = notification(
            NotificationSource::Market,
            serde_json::json!({"price_delta_pct": -7.5}),
        );
        assert!(should_escalate(&n, 5.0, 0.7));
    }

    #[test]
    fn test_market_rise_never_escalates() {
        let n = notification(
            NotificationSource::Market,
            serde_json::json!({"price_delta_pct": 9.0}),
        );
        assert!(!should_escalate(&n, 5.0, 0.7));
    }

    #[test]
    fn test_small_drop_stays_in_log() {
        let n = notification(
            NotificationSource::Market,
            serde_json::json!({"price_delta_pct": -2.0}),
        );
        assert!(!should_escalate(&n, 5.0, 0.7));
    }

    #[test]
    fn test_wallet_escalates_on_suspicious_flag() {
        let flagged = notification(
            NotificationSource::Wallet,
            serde_json::json!({"suspicious": true}),
        );
        let clean = notification(
            NotificationSource::Wallet,
            serde_json::json!({"suspicious": false}),
        );
        assert!(should_escalate(&flagged, 5.0, 0.7));
        assert!(!should_escalate(&clean, 5.0, 0.7));
    }

    #[test]
    fn test_social_escalates_at_severity_threshold() {
        let n = notification(
            NotificationSource::Social,
            serde_json::json!({"severity": 0.7}),
        );
        assert!(should_escalate(&n, 5.0, 0.7));
    }

    #[test]
    fn test_missing_payload_fields_never_escalate() {
        let n = notification(NotificationSource::Market, serde_json::json!({}));
        assert!(!should_escalate(&n, 5.0, 0.7));
    }
}
