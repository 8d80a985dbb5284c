//! Built-in Scheduled Tasks
//!
//! Each task is an async function that performs one monitoring or
//! maintenance pass and returns a `TaskResult` indicating whether it
//! escalated to a full agent cycle. Monitors append what they observe to
//! the notification log; only observations past their escalation
//! threshold push a trigger onto the cycle queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::monitor::should_escalate;
use crate::state::Database;
use crate::types::{CycleTrigger, Retriever, SignalFeed};

/// Everything a scheduled task may touch.
pub struct TaskContext {
    pub db: Arc<Mutex<Database>>,
    pub market_feed: Arc<dyn SignalFeed>,
    pub social_feed: Arc<dyn SignalFeed>,
    pub wallet_feed: Arc<dyn SignalFeed>,
    pub retriever: Arc<dyn Retriever>,
    pub cycles: UnboundedSender<CycleTrigger>,
    pub price_drop_threshold_pct: f64,
    pub social_severity_threshold: f64,
    pub notification_retention_days: i64,
}

/// Result of a scheduled task execution.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Whether this task pushed a trigger onto the cycle queue.
    pub escalated: bool,
    /// Optional human-readable message describing the result.
    pub message: Option<String>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            escalated: false,
            message: None,
        }
    }

    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Self {
            escalated: false,
            message: Some(msg.into()),
        }
    }

    pub fn escalated(msg: impl Into<String>) -> Self {
        Self {
            escalated: true,
            message: Some(msg.into()),
        }
    }
}

/// Type alias for a boxed async scheduled task function.
pub type ScheduledTaskFn =
    fn(&TaskContext) -> Pin<Box<dyn Future<Output = Result<TaskResult>> + Send + '_>>;

/// Returns the registry of built-in scheduled task functions.
#[allow(non_snake_case)]
pub fn BUILTIN_TASKS() -> HashMap<&'static str, ScheduledTaskFn> {
    let mut map: HashMap<&'static str, ScheduledTaskFn> = HashMap::new();
    map.insert("market_monitor", |ctx| Box::pin(market_monitor(ctx)));
    map.insert("social_monitor", |ctx| Box::pin(social_monitor(ctx)));
    map.insert("wallet_monitor", |ctx| Box::pin(wallet_monitor(ctx)));
    map.insert("intel_refresh", |ctx| Box::pin(intel_refresh(ctx)));
    map.insert("cache_refresh", |ctx| Box::pin(cache_refresh(ctx)));
    map
}

/// Poll the market feed for price movement on monitored tokens.
pub async fn market_monitor(ctx: &TaskContext) -> Result<TaskResult> {
    poll_feed(ctx, &ctx.market_feed, "market_monitor").await
}

/// Poll the social feed for chatter about monitored keywords.
pub async fn social_monitor(ctx: &TaskContext) -> Result<TaskResult> {
    poll_feed(ctx, &ctx.social_feed, "social_monitor").await
}

/// Poll the wallet feed for suspicious transactions on monitored wallets.
pub async fn wallet_monitor(ctx: &TaskContext) -> Result<TaskResult> {
    poll_feed(ctx, &ctx.wallet_feed, "wallet_monitor").await
}

/// Shared monitor body: poll, append to the log, escalate past-threshold
/// observations. One trigger per poll even when several notifications
/// cross the line; the cycle reads the whole window anyway.
async fn poll_feed(
    ctx: &TaskContext,
    feed: &Arc<dyn SignalFeed>,
    task_name: &str,
) -> Result<TaskResult> {
    let targets = {
        let db = ctx.db.lock().unwrap();
        db.get_targets()?
    };

    let notifications = feed.poll(&targets).await?;
    if notifications.is_empty() {
        debug!("{}: nothing observed", task_name);
        return Ok(TaskResult::ok());
    }

    let now = Utc::now().to_rfc3339();
    let mut escalation: Option<String> = None;
    {
        let db = ctx.db.lock().unwrap();
        for notification in &notifications {
            db.insert_notification(notification)?;
            if let Some(target) = &notification.target {
                db.touch_target(target, &now)?;
            }
            if escalation.is_none()
                && should_escalate(
                    notification,
                    ctx.price_drop_threshold_pct,
                    ctx.social_severity_threshold,
                )
            {
                escalation = Some(notification.summary.clone());
            }
        }
    }

    info!("{}: appended {} notifications", task_name, notifications.len());

    if let Some(reason) = escalation {
        info!("{}: escalating to cycle ({})", task_name, reason);
        if ctx
            .cycles
            .send(CycleTrigger::new(task_name, reason.clone()))
            .is_err()
        {
            warn!("{}: cycle queue closed, escalation dropped", task_name);
        }
        return Ok(TaskResult::escalated(reason));
    }

    Ok(TaskResult::ok_with_message(format!(
        "{} notifications logged",
        notifications.len()
    )))
}

/// Warm the threat-intelligence index so cycle-time retrieval hits a
/// fresh cache. A failure here is a degraded pass, never an error.
pub async fn intel_refresh(ctx: &TaskContext) -> Result<TaskResult> {
    match ctx
        .retriever
        .retrieve("latest blockchain exploits and drainer campaigns", 5)
        .await
    {
        Ok(passages) => Ok(TaskResult::ok_with_message(format!(
            "intel index warm ({} passages)",
            passages.len()
        ))),
        Err(e) => {
            warn!("intel_refresh: retrieval unavailable: {}", e);
            Ok(TaskResult::ok_with_message("intel index unreachable"))
        }
    }
}

/// Prune consumed notifications past the retention window.
pub async fn cache_refresh(ctx: &TaskContext) -> Result<TaskResult> {
    let cutoff = (Utc::now() - Duration::days(ctx.notification_retention_days)).to_rfc3339();
    let pruned = {
        let db = ctx.db.lock().unwrap();
        db.prune_consumed_notifications(&cutoff)?
    };
    if pruned > 0 {
        info!("cache_refresh: pruned {} consumed notifications", pruned);
    }
    Ok(TaskResult::ok_with_message(format!("pruned {}", pruned)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::types::{
        MonitoringTarget, Notification, NotificationSource, Passage, TargetKind,
    };

    struct FixedFeed {
        source: NotificationSource,
        payload: serde_json::Value,
    }

    #[async_trait]
    impl SignalFeed for FixedFeed {
        fn source(&self) -> NotificationSource {
            self.source.clone()
        }

        async fn poll(&self, targets: &[MonitoringTarget]) -> Result<Vec<Notification>> {
            Ok(targets
                .iter()
                .map(|t| Notification {
                    id: uuid::Uuid::new_v4().to_string(),
                    source: self.source.clone(),
                    target: Some(t.value.clone()),
                    summary: format!("event on {}", t.value),
                    payload: self.payload.clone(),
                    created_at: Utc::now().to_rfc3339(),
                    consumed_at: None,
                })
                .collect())
        }
    }

    struct EmptyRetriever;

    #[async_trait]
    impl Retriever for EmptyRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>> {
            Ok(vec![])
        }
    }

    fn context(
        payload: serde_json::Value,
    ) -> (TaskContext, mpsc::UnboundedReceiver<CycleTrigger>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        db.lock()
            .unwrap()
            .insert_target(&MonitoringTarget {
                id: "t-1".to_string(),
                kind: TargetKind::Token,
                value: "SOL".to_string(),
                created_at: Utc::now().to_rfc3339(),
                last_observed: None,
            })
            .unwrap();

        let feed: Arc<dyn SignalFeed> = Arc::new(FixedFeed {
            source: NotificationSource::Market,
            payload,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskContext {
                db,
                market_feed: feed.clone(),
                social_feed: feed.clone(),
                wallet_feed: feed,
                retriever: Arc::new(EmptyRetriever),
                cycles: tx,
                price_drop_threshold_pct: 5.0,
                social_severity_threshold: 0.7,
                notification_retention_days: 7,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_monitor_appends_without_escalating_below_threshold() {
        let (ctx, mut rx) = context(serde_json::json!({"price_delta_pct": -1.0}));

        let result = market_monitor(&ctx).await.unwrap();
        assert!(!result.escalated);
        assert!(rx.try_recv().is_err());

        let window = ctx
            .db
            .lock()
            .unwrap()
            .recent_unconsumed_notifications(25)
            .unwrap();
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_escalates_past_threshold() {
        let (ctx, mut rx) = context(serde_json::json!({"price_delta_pct": -9.3}));

        let result = market_monitor(&ctx).await.unwrap();
        assert!(result.escalated);

        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.source, "market_monitor");
        assert!(trigger.reason.contains("SOL"));
    }

    #[tokio::test]
    async fn test_cache_refresh_prunes_old_consumed() {
        let (ctx, _rx) = context(serde_json::json!({}));
        {
            let db = ctx.db.lock().unwrap();
            db.insert_notification(&Notification {
                id: "old".to_string(),
                source: NotificationSource::Market,
                target: None,
                summary: "ancient".to_string(),
                payload: serde_json::json!({}),
                created_at: "2020-01-01T00:00:00Z".to_string(),
                consumed_at: None,
            })
            .unwrap();
            db.mark_notifications_consumed(&["old".to_string()], "2020-01-02T00:00:00Z")
                .unwrap();
        }

        let result = cache_refresh(&ctx).await.unwrap();
        assert_eq!(result.message.as_deref(), Some("pruned 1"));
    }

    #[test]
    fn test_registry_covers_all_default_tasks() {
        let registry = BUILTIN_TASKS();
        for task in [
            "market_monitor",
            "social_monitor",
            "wallet_monitor",
            "intel_refresh",
            "cache_refresh",
        ] {
            assert!(registry.contains_key(task), "missing task {task}");
        }
    }
}
