//! Agent Cycle
//!
//! One full pass of the sentinel's reasoning: analyze the environment,
//! form a defense strategy, execute quarantine actions, record the
//! outcome. Each stage runs through the regeneration loop; what happens
//! when a stage exhausts its retries is the failure policy's call.
//!
//! State transitions are persisted as they happen so a crashed process
//! leaves an honest trail, and every attempt of every stage lands in the
//! audit table whether it succeeded or not.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SentinelError;
use crate::state::Database;
use crate::types::{
    CycleRecord, CycleState, CycleStatus, CycleTrigger, FailurePolicy, LoopOutcome, MetricState,
    Notification, RequestKind, StageOutcome, StageStatus,
};

use super::context::ContextAssembler;
use super::regen::RegenerationLoop;

pub struct CycleEngine {
    db: Arc<Mutex<Database>>,
    assembler: ContextAssembler,
    regen: RegenerationLoop,
    max_attempts: u32,
    failure_policy: FailurePolicy,
}

impl CycleEngine {
    pub fn new(
        db: Arc<Mutex<Database>>,
        assembler: ContextAssembler,
        regen: RegenerationLoop,
        max_attempts: u32,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            db,
            assembler,
            regen,
            max_attempts,
            failure_policy,
        }
    }

    /// Run one cycle to completion. Stage failures are absorbed into the
    /// record; an `Err` here means persistence itself broke.
    pub async fn run(&self, trigger: CycleTrigger) -> Result<CycleRecord> {
        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        info!(
            "Cycle {} starting (trigger: {} - {})",
            cycle_id, trigger.source, trigger.reason
        );

        let (metric_before, prior_strategy, first_run) = {
            let db = self.db.lock().unwrap();
            let metric = db.get_metric_state()?;
            let last = db.last_completed_record()?;
            let prior = last.as_ref().and_then(|record| {
                record
                    .stages
                    .iter()
                    .find(|s| s.kind == RequestKind::Strategy && s.status == StageStatus::Success)
                    .map(|s| s.output.clone())
            });
            (metric, prior, last.is_none())
        };

        let mut stages: Vec<StageOutcome> = Vec::new();

        // ── Analyzing ────────────────────────────────────────────
        self.set_state(CycleState::Analyzing)?;
        let analysis_kind = if first_run {
            RequestKind::AnalysisFirst
        } else {
            RequestKind::Analysis
        };
        let request = self
            .assembler
            .build(analysis_kind, prior_strategy, metric_before.clone())
            .await?;
        let consumed_window: Vec<Notification> = request.notifications.clone();
        let analysis = self.run_stage(&cycle_id, analysis_kind, &request).await?;
        let analysis_failed = analysis.status == StageStatus::FailedAfterRetries;
        let analysis_output = analysis.output.clone();
        stages.push(analysis);

        if analysis_failed && self.failure_policy == FailurePolicy::Abort {
            return self.abort(cycle_id, trigger, started_at, metric_before, stages);
        }

        // ── Strategizing ─────────────────────────────────────────
        self.set_state(CycleState::Strategizing)?;
        let strategy_input = if analysis_failed {
            warn!("Analysis exhausted retries; strategizing on an empty analysis");
            String::new()
        } else {
            analysis_output
        };
        let request = self
            .assembler
            .build(
                RequestKind::Strategy,
                Some(strategy_input),
                metric_before.clone(),
            )
            .await?;
        let strategy = self
            .run_stage(&cycle_id, RequestKind::Strategy, &request)
            .await?;
        let strategy_succeeded = strategy.status == StageStatus::Success;
        let strategy_text = strategy.output.clone();
        stages.push(strategy);

        if !strategy_succeeded && self.failure_policy == FailurePolicy::Abort {
            return self.abort(cycle_id, trigger, started_at, metric_before, stages);
        }

        // ── Quarantining ─────────────────────────────────────────
        // Quarantine acts on a strategy. Without one there is nothing
        // safe to execute, whatever the failure policy says.
        if strategy_succeeded {
            self.set_state(CycleState::Quarantining)?;
            let request = self
                .assembler
                .build(
                    RequestKind::Quarantine,
                    Some(strategy_text),
                    metric_before.clone(),
                )
                .await?;
            let quarantine = self
                .run_stage(&cycle_id, RequestKind::Quarantine, &request)
                .await?;
            let quarantine_failed = quarantine.status == StageStatus::FailedAfterRetries;
            stages.push(quarantine);

            if quarantine_failed && self.failure_policy == FailurePolicy::Abort {
                return self.abort(cycle_id, trigger, started_at, metric_before, stages);
            }
        } else {
            warn!("No strategy produced; skipping quarantine");
            stages.push(StageOutcome {
                kind: RequestKind::Quarantine,
                status: StageStatus::Skipped,
                output: String::new(),
                findings: None,
                attempts_used: 0,
            });
        }

        // ── Recording ────────────────────────────────────────────
        self.set_state(CycleState::Recording)?;
        let metric_after = fold_metric(&metric_before, &stages);
        let status = if stages
            .iter()
            .any(|s| s.status == StageStatus::FailedAfterRetries || s.status == StageStatus::Skipped)
        {
            CycleStatus::FailedAfterRetries
        } else {
            CycleStatus::Completed
        };

        let record = CycleRecord {
            id: cycle_id,
            trigger: format!("{}: {}", trigger.source, trigger.reason),
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            status: status.clone(),
            metric_before,
            metric_after: Some(metric_after.clone()),
            stages,
        };

        self.assembler.consume(&consumed_window)?;
        {
            let db = self.db.lock().unwrap();
            db.insert_cycle_record(&record)?;
            db.set_metric_state(&metric_after)?;
        }
        self.set_state(CycleState::Idle)?;

        info!(
            "Cycle {} finished ({:?}): score {:.2} -> {:.2}",
            record.id,
            status,
            record.metric_before.security_score,
            metric_after.security_score
        );
        Ok(record)
    }

    async fn run_stage(
        &self,
        cycle_id: &str,
        kind: RequestKind,
        request: &crate::types::GenerationRequest,
    ) -> Result<StageOutcome> {
        let outcome = self.regen.run(request, self.max_attempts).await;
        self.persist_attempts(cycle_id, kind, &outcome)?;

        let LoopOutcome {
            result,
            attempts,
            exhausted,
        } = outcome;

        Ok(StageOutcome {
            kind,
            status: if exhausted {
                StageStatus::FailedAfterRetries
            } else {
                StageStatus::Success
            },
            output: result.stdout,
            findings: result.findings,
            attempts_used: attempts.len() as u32,
        })
    }

    fn persist_attempts(
        &self,
        cycle_id: &str,
        kind: RequestKind,
        outcome: &LoopOutcome,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        for attempt in &outcome.attempts {
            db.insert_stage_attempt(cycle_id, kind, attempt)?;
        }
        Ok(())
    }

    fn abort(
        &self,
        cycle_id: String,
        trigger: CycleTrigger,
        started_at: String,
        metric_before: MetricState,
        stages: Vec<StageOutcome>,
    ) -> Result<CycleRecord> {
        let stage = stages
            .last()
            .map(|s| s.kind.as_str())
            .unwrap_or("analysis");
        error!(
            "Cycle {}: {}",
            cycle_id,
            SentinelError::CycleAborted {
                stage: stage.to_string()
            }
        );
        self.set_state(CycleState::Aborted)?;
        let record = CycleRecord {
            id: cycle_id,
            trigger: format!("{}: {}", trigger.source, trigger.reason),
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            status: CycleStatus::Aborted,
            metric_before,
            metric_after: None,
            stages,
        };
        {
            let db = self.db.lock().unwrap();
            db.insert_cycle_record(&record)?;
        }
        // The unconsumed window stays for the next cycle.
        self.set_state(CycleState::Idle)?;
        Ok(record)
    }

    fn set_state(&self, state: CycleState) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.set_cycle_state(&state)?;
        Ok(())
    }
}

/// Fold stage findings into the metric state. Analysis reports overwrite
/// the score and threat count; quarantine reports add to the quarantined
/// total.
fn fold_metric(before: &MetricState, stages: &[StageOutcome]) -> MetricState {
    let mut metric = before.clone();
    for stage in stages {
        let Some(ref findings) = stage.findings else {
            continue;
        };
        if let Some(score) = findings["security_score"].as_f64() {
            metric.security_score = score.clamp(0.0, 1.0);
        }
        if let Some(threats) = findings["threats_detected"].as_u64() {
            metric.threats_detected = threats;
        }
        if let Some(quarantined) = findings["quarantined_items"].as_u64() {
            if stage.kind == RequestKind::Quarantine {
                metric.quarantined_items += quarantined;
            } else {
                metric.quarantined_items = metric.quarantined_items.max(quarantined);
            }
        }
    }
    metric.observed_at = Utc::now().to_rfc3339();
    metric
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    use crate::types::{
        ExecutionResult, GenerationRequest, Generator, NotificationSource, Passage, Retriever,
        Sandbox,
    };

    /// Generator that answers per request kind. Analysis and quarantine
    /// get code; strategy gets prose. A kind listed in `failing` gets
    /// code the sandbox will reject (or empty prose for strategy).
    struct KindedGenerator {
        failing: Vec<RequestKind>,
    }

    #[async_trait]
    impl Generator for KindedGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            let fails = self.failing.contains(&request.kind);
            Ok(match request.kind {
                RequestKind::Strategy => {
                    if fails {
                        String::new()
                    } else {
                        "Quarantine the flagged approvals first, then rotate keys.".to_string()
                    }
                }
                _ if fails => "```python\nimport sys\nraise RuntimeError('boom')\n```".to_string(),
                RequestKind::Quarantine => {
                    "```python\nimport json\nprint(json.dumps({'quarantined_items': 2}))\n```"
                        .to_string()
                }
                _ => {
                    "```python\nimport json\nprint(json.dumps({'security_score': 0.85, 'threats_detected': 3}))\n```"
                        .to_string()
                }
            })
        }
    }

    /// Sandbox that fails any code containing `raise` and otherwise
    /// succeeds, echoing the JSON the code would have printed.
    struct MarkerSandbox;

    #[async_trait]
    impl Sandbox for MarkerSandbox {
        async fn execute(&self, code: &str, _env: &BTreeMap<String, String>) -> ExecutionResult {
            if code.contains("raise") {
                return ExecutionResult::failed("RuntimeError: boom");
            }
            let json_line = code
                .lines()
                .find(|l| l.contains("json.dumps"))
                .and_then(|l| l.split_once("json.dumps(").map(|(_, rest)| rest))
                .map(|rest| rest.trim_end_matches(&[')', ']'][..]).replace('\'', "\""))
                .unwrap_or_else(|| "{}".to_string());
            let findings = serde_json::from_str(&json_line).ok();
            ExecutionResult {
                success: true,
                stdout: json_line,
                stderr: String::new(),
                findings,
                error: None,
                duration_ms: 1,
            }
        }
    }

    struct EmptyRetriever;

    #[async_trait]
    impl Retriever for EmptyRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<Passage>> {
            Ok(vec![])
        }
    }

    fn engine(failing: Vec<RequestKind>, policy: FailurePolicy) -> (CycleEngine, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let generator = Arc::new(KindedGenerator { failing });
        let sandbox = Arc::new(MarkerSandbox);
        let assembler = ContextAssembler::new(db.clone(), Arc::new(EmptyRetriever), vec![], 25, 5);
        let regen = RegenerationLoop::new(generator, sandbox);
        (
            CycleEngine::new(db.clone(), assembler, regen, 3, policy),
            db,
        )
    }

    fn seed_notification(db: &Arc<Mutex<Database>>) {
        db.lock()
            .unwrap()
            .insert_notification(&crate::types::Notification {
                id: Uuid::new_v4().to_string(),
                source: NotificationSource::Market,
                target: Some("SOL".to_string()),
                summary: "price dropped 8%".to_string(),
                payload: serde_json::json!({"price_delta_pct": -8.0}),
                created_at: Utc::now().to_rfc3339(),
                consumed_at: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_cycle_completes_and_folds_metrics() {
        let (engine, db) = engine(vec![], FailurePolicy::Degrade);
        seed_notification(&db);

        let record = engine
            .run(CycleTrigger::new("market_monitor", "price drop"))
            .await
            .unwrap();

        assert_eq!(record.status, CycleStatus::Completed);
        assert_eq!(record.stages.len(), 3);
        assert!(record.stages.iter().all(|s| s.status == StageStatus::Success));

        let after = record.metric_after.unwrap();
        assert!((after.security_score - 0.85).abs() < 1e-9);
        assert_eq!(after.threats_detected, 3);
        assert_eq!(after.quarantined_items, 2);

        // window consumed, record and metric persisted, state back to idle
        let db = db.lock().unwrap();
        assert!(db.recent_unconsumed_notifications(25).unwrap().is_empty());
        assert!(db.last_completed_record().unwrap().is_some());
        assert_eq!(db.get_cycle_state().unwrap(), CycleState::Idle);
        assert_eq!(db.get_metric_state().unwrap().quarantined_items, 2);
    }

    #[tokio::test]
    async fn test_first_cycle_uses_baseline_analysis() {
        let (engine, _db) = engine(vec![], FailurePolicy::Degrade);
        let record = engine
            .run(CycleTrigger::new("cli", "once"))
            .await
            .unwrap();
        assert_eq!(record.stages[0].kind, RequestKind::AnalysisFirst);

        // second cycle sees the completed record and drops the baseline kind
        let record = engine
            .run(CycleTrigger::new("cli", "once"))
            .await
            .unwrap();
        assert_eq!(record.stages[0].kind, RequestKind::Analysis);
    }

    #[tokio::test]
    async fn test_quarantine_exhaustion_keeps_earlier_stage_results() {
        let (engine, db) = engine(vec![RequestKind::Quarantine], FailurePolicy::Degrade);

        let record = engine
            .run(CycleTrigger::new("wallet_monitor", "suspicious tx"))
            .await
            .unwrap();

        assert_eq!(record.status, CycleStatus::FailedAfterRetries);
        assert_eq!(record.stages[0].status, StageStatus::Success);
        assert_eq!(record.stages[1].status, StageStatus::Success);
        assert_eq!(record.stages[2].status, StageStatus::FailedAfterRetries);
        assert_eq!(record.stages[2].attempts_used, 3);

        // all three quarantine attempts are in the audit table
        let attempts = db.lock().unwrap().get_stage_attempts(&record.id).unwrap();
        let quarantine_attempts = attempts
            .iter()
            .filter(|(stage, _, _)| stage == "quarantine")
            .count();
        assert_eq!(quarantine_attempts, 3);
    }

    #[tokio::test]
    async fn test_abort_policy_stops_after_analysis() {
        let (engine, db) = engine(
            vec![RequestKind::Analysis, RequestKind::AnalysisFirst],
            FailurePolicy::Abort,
        );
        seed_notification(&db);

        let record = engine
            .run(CycleTrigger::new("market_monitor", "price drop"))
            .await
            .unwrap();

        assert_eq!(record.status, CycleStatus::Aborted);
        assert_eq!(record.stages.len(), 1);
        assert!(record.metric_after.is_none());

        // aborted cycles leave the window unconsumed
        let db = db.lock().unwrap();
        assert_eq!(db.recent_unconsumed_notifications(25).unwrap().len(), 1);
        assert!(db.last_completed_record().unwrap().is_none());
        assert_eq!(db.get_cycle_state().unwrap(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_strategy_failure_skips_quarantine_under_degrade() {
        let (engine, _db) = engine(vec![RequestKind::Strategy], FailurePolicy::Degrade);

        let record = engine
            .run(CycleTrigger::new("scheduler", "interval"))
            .await
            .unwrap();

        assert_eq!(record.status, CycleStatus::FailedAfterRetries);
        let quarantine = record
            .stages
            .iter()
            .find(|s| s.kind == RequestKind::Quarantine)
            .unwrap();
        assert_eq!(quarantine.status, StageStatus::Skipped);
        assert_eq!(quarantine.attempts_used, 0);
    }

    #[test]
    fn test_fold_metric_clamps_score() {
        let stages = vec![StageOutcome {
            kind: RequestKind::Analysis,
            status: StageStatus::Success,
            output: String::new(),
            findings: Some(serde_json::json!({"security_score": 4.2})),
            attempts_used: 1,
        }];
        let after = fold_metric(&MetricState::default(), &stages);
        assert!((after.security_score - 1.0).abs() < 1e-9);
    }
}
