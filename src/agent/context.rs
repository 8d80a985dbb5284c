//! Context Assembler
//!
//! Builds the [`GenerationRequest`] for each cycle stage: the recent
//! unconsumed notification window, the tool bindings, prior stage output,
//! and retrieved threat intelligence. Retrieval is the one soft
//! dependency here; when it fails the request carries a degradation note
//! instead of passages and the cycle continues.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::state::Database;
use crate::types::{
    GenerationRequest, MetricState, Notification, Passage, RequestKind, Retriever, ToolBinding,
};

/// Carried as a passage when the retrieval service is unreachable, so the
/// model knows its intelligence is stale rather than empty.
const RETRIEVAL_DEGRADED: &str =
    "Threat intelligence retrieval is currently unavailable. Proceed on notifications alone.";

pub struct ContextAssembler {
    db: Arc<Mutex<Database>>,
    retriever: Arc<dyn Retriever>,
    tools: Vec<ToolBinding>,
    notification_window: usize,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(
        db: Arc<Mutex<Database>>,
        retriever: Arc<dyn Retriever>,
        tools: Vec<ToolBinding>,
        notification_window: usize,
        top_k: usize,
    ) -> Self {
        Self {
            db,
            retriever,
            tools,
            notification_window,
            top_k,
        }
    }

    /// Assemble the request for one stage.
    ///
    /// Notifications are read but not consumed here; the cycle marks them
    /// consumed once it finishes, so an aborted cycle leaves the window
    /// intact for the next one.
    pub async fn build(
        &self,
        kind: RequestKind,
        prior: Option<String>,
        metric_before: MetricState,
    ) -> Result<GenerationRequest> {
        let notifications = {
            let db = self.db.lock().unwrap();
            db.recent_unconsumed_notifications(self.notification_window)?
        };

        let passages = if kind.wants_retrieval() {
            self.retrieve_passages(&notifications).await
        } else {
            vec![]
        };

        Ok(GenerationRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            notifications,
            tools: self.tools.clone(),
            prior,
            passages,
            metric_before,
            regen: None,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Mark the window a finished cycle consumed.
    pub fn consume(&self, notifications: &[Notification]) -> Result<()> {
        if notifications.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = notifications.iter().map(|n| n.id.clone()).collect();
        let db = self.db.lock().unwrap();
        db.mark_notifications_consumed(&ids, &Utc::now().to_rfc3339())?;
        Ok(())
    }

    async fn retrieve_passages(&self, notifications: &[Notification]) -> Vec<Passage> {
        let query = if notifications.is_empty() {
            "blockchain security baseline threats".to_string()
        } else {
            notifications
                .iter()
                .map(|n| n.summary.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        match self.retriever.retrieve(&query, self.top_k).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(
                    "Degrading context: {}",
                    crate::error::SentinelError::RetrievalUnavailable(e.to_string())
                );
                vec![Passage {
                    text: RETRIEVAL_DEGRADED.to_string(),
                    score: 0.0,
                    source: None,
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::types::NotificationSource;

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>> {
            anyhow::bail!("connection refused")
        }
    }

    struct FixedRetriever;

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>> {
            Ok(vec![Passage {
                text: "known drainer pattern".to_string(),
                score: 0.9,
                source: None,
            }])
        }
    }

    fn seeded_db() -> Arc<Mutex<Database>> {
        let db = Database::open_in_memory().unwrap();
        for i in 0..3 {
            db.insert_notification(&Notification {
                id: format!("n-{i}"),
                source: NotificationSource::Market,
                target: Some("SOL".to_string()),
                summary: format!("event {i}"),
                payload: serde_json::json!({}),
                created_at: Utc::now().to_rfc3339(),
                consumed_at: None,
            })
            .unwrap();
        }
        Arc::new(Mutex::new(db))
    }

    #[tokio::test]
    async fn test_builds_request_with_window_and_passages() {
        let assembler = ContextAssembler::new(
            seeded_db(),
            Arc::new(FixedRetriever),
            vec![],
            25,
            5,
        );
        let request = assembler
            .build(RequestKind::Analysis, None, MetricState::default())
            .await
            .unwrap();

        assert_eq!(request.notifications.len(), 3);
        assert_eq!(request.passages.len(), 1);
        assert!(request.regen.is_none());
    }

    #[tokio::test]
    async fn test_retrieval_failure_degrades_not_fails() {
        let assembler = ContextAssembler::new(
            seeded_db(),
            Arc::new(FailingRetriever),
            vec![],
            25,
            5,
        );
        let request = assembler
            .build(RequestKind::Analysis, None, MetricState::default())
            .await
            .unwrap();

        assert_eq!(request.passages.len(), 1);
        assert!(request.passages[0].text.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_quarantine_skips_retrieval() {
        let assembler = ContextAssembler::new(
            seeded_db(),
            Arc::new(FailingRetriever),
            vec![],
            25,
            5,
        );
        let request = assembler
            .build(RequestKind::Quarantine, Some("strategy".to_string()), MetricState::default())
            .await
            .unwrap();

        assert!(request.passages.is_empty());
        assert_eq!(request.prior.as_deref(), Some("strategy"));
    }

    #[tokio::test]
    async fn test_consume_clears_the_window() {
        let db = seeded_db();
        let assembler = ContextAssembler::new(
            db.clone(),
            Arc::new(FixedRetriever),
            vec![],
            25,
            5,
        );
        let request = assembler
            .build(RequestKind::Analysis, None, MetricState::default())
            .await
            .unwrap();
        assembler.consume(&request.notifications).unwrap();

        let remaining = db
            .lock()
            .unwrap()
            .recent_unconsumed_notifications(25)
            .unwrap();
        assert!(remaining.is_empty());
    }
}
