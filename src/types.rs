//! Sentinel - Type Definitions
//!
//! All shared types for the blockchain-security agent core:
//! the monitoring data model, generation/execution records,
//! cycle records, and the collaborator trait seams.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// ─── Monitoring ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Wallet,
    Token,
    SocialKeyword,
}

/// Something the agent watches: a wallet address, a token, or a social
/// keyword. Immutable once created except for `last_observed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    pub id: String,
    pub kind: TargetKind,
    pub value: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<String>,
}

/// A target as declared in configuration: kind and value only. Ids and
/// timestamps are assigned when the entry is seeded into the database.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub kind: TargetKind,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Market,
    Social,
    Wallet,
    Intel,
}

impl NotificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationSource::Market => "market",
            NotificationSource::Social => "social",
            NotificationSource::Wallet => "wallet",
            NotificationSource::Intel => "intel",
        }
    }
}

/// A discrete observed event: a price delta, a suspicious transaction,
/// a social post. Created by monitor tasks, consumed by the context
/// assembler. The notification log is append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub source: NotificationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub summary: String,
    pub payload: serde_json::Value,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<String>,
}

// ─── Metric State ────────────────────────────────────────────────

/// The agent's tracked risk indicator, read before and after each cycle.
/// Owned exclusively by the currently-running cycle; timers never write it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricState {
    pub security_score: f64,
    pub threats_detected: u64,
    pub quarantined_items: u64,
    pub observed_at: String,
}

impl Default for MetricState {
    fn default() -> Self {
        Self {
            security_score: 1.0,
            threats_detected: 0,
            quarantined_items: 0,
            observed_at: String::new(),
        }
    }
}

// ─── Generation Requests ─────────────────────────────────────────

/// Which prompt variant a generation request uses. The five prompt
/// shapes of the agent (analysis, first-run analysis, strategy,
/// quarantine, regeneration) are one request type with a discriminant
/// plus an optional regeneration context, not five code paths.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Analysis,
    AnalysisFirst,
    Strategy,
    Quarantine,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Analysis => "analysis",
            RequestKind::AnalysisFirst => "analysis_first",
            RequestKind::Strategy => "strategy",
            RequestKind::Quarantine => "quarantine",
        }
    }

    /// Analysis and quarantine requests produce code that must be executed
    /// in the sandbox. Strategy requests produce plain text used as-is.
    pub fn executes_code(&self) -> bool {
        !matches!(self, RequestKind::Strategy)
    }

    /// Analysis and strategy requests are enriched with retrieved
    /// threat-intelligence passages.
    pub fn wants_retrieval(&self) -> bool {
        matches!(
            self,
            RequestKind::Analysis | RequestKind::AnalysisFirst | RequestKind::Strategy
        )
    }
}

/// An API or security tool the generated code is authorized to use.
/// `env` holds the exact environment values injected into the sandbox
/// for this tool; nothing outside the bound set is visible to the code.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBinding {
    pub name: String,
    pub description: String,
    pub env: BTreeMap<String, String>,
    pub required: bool,
}

/// A retrieved threat-intelligence passage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    pub text: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Carried by a regeneration request: the accumulated error trace and
/// the code that failed, so the model can repair its previous attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenContext {
    /// 1-based attempt number this request belongs to. Strictly
    /// increasing within one stage.
    pub attempt: u32,
    pub errors: String,
    pub failed_code: String,
}

/// Everything a generation call needs. Built fresh per stage and never
/// mutated; a regeneration builds a new request via
/// [`GenerationRequest::regenerating`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub id: String,
    pub kind: RequestKind,
    pub notifications: Vec<Notification>,
    pub tools: Vec<ToolBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,
    pub passages: Vec<Passage>,
    pub metric_before: MetricState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regen: Option<RegenContext>,
    pub created_at: String,
}

impl GenerationRequest {
    /// Build a new request for a corrective retry. The original request
    /// is left untouched; the copy carries the error trace and failed code.
    pub fn regenerating(&self, attempt: u32, errors: String, failed_code: String) -> Self {
        let mut next = self.clone();
        next.id = uuid::Uuid::new_v4().to_string();
        next.regen = Some(RegenContext {
            attempt,
            errors,
            failed_code,
        });
        next.created_at = chrono::Utc::now().to_rfc3339();
        next
    }

    /// The environment values the request's tool list authorizes.
    pub fn bound_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for tool in &self.tools {
            for (key, value) in &tool.env {
                env.insert(key.clone(), value.clone());
            }
        }
        env
    }
}

// ─── Execution ───────────────────────────────────────────────────

/// The outcome of running one piece of generated code (or, for strategy
/// requests, of accepting one generated text). Exactly one exists per
/// request attempt; immutable once produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            findings: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }
}

/// One attempt inside the regeneration loop, kept for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub code: String,
    pub result: ExecutionResult,
}

/// What the regeneration loop hands back to the cycle: the terminal
/// result, every attempt made, and whether the retry budget ran out.
#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub result: ExecutionResult,
    pub attempts: Vec<AttemptRecord>,
    pub exhausted: bool,
}

// ─── Cycle ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Analyzing,
    Strategizing,
    Quarantining,
    Recording,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    FailedAfterRetries,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    FailedAfterRetries,
    Skipped,
}

/// The recorded outcome of one stage of a cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub kind: RequestKind,
    pub status: StageStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<serde_json::Value>,
    pub attempts_used: u32,
}

/// One full Analysis -> Strategy -> Quarantine pass. Persisted at
/// completion (or abortion, with the stages attempted so far) for audit
/// and as the "previous analysis" input to the next cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRecord {
    pub id: String,
    pub trigger: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: CycleStatus,
    pub metric_before: MetricState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_after: Option<MetricState>,
    pub stages: Vec<StageOutcome>,
}

/// A request to start a cycle, produced by scheduler timers. Triggers
/// that arrive while a cycle is in flight are queued, never run
/// concurrently.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleTrigger {
    pub source: String,
    pub reason: String,
    pub requested_at: String,
}

impl CycleTrigger {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
            requested_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// What happens to the cycle when a stage exhausts its retry budget.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the cycle; record the stages attempted so far as aborted.
    Abort,
    /// Forward an empty payload to the next stage and keep going.
    Degrade,
}

// ─── Scheduler ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub name: String,
    pub schedule: String,
    pub task: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub entries: Vec<ScheduleEntry>,
    pub tick_interval_secs: u64,
}

// ─── Collaborator Interfaces ─────────────────────────────────────

/// The generation collaborator: turns a request into code (or, for
/// strategy requests, text). Failures and timeouts are loop failures,
/// never fatal.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String>;
}

/// The retrieval collaborator: relevant threat-intelligence passages
/// for a query, best first. Callers degrade to an empty sequence when
/// this is unavailable.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<Passage>>;
}

/// Isolated execution of untrusted generated code. Implementations must
/// bound execution time, expose only the given environment values, and
/// report faults through the result rather than returning an error.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, code: &str, env: &BTreeMap<String, String>) -> ExecutionResult;
}

/// A polling data source (price feed, social scraper, wallet watcher)
/// that turns external events into notifications.
#[async_trait]
pub trait SignalFeed: Send + Sync {
    fn source(&self) -> NotificationSource;
    async fn poll(&self, targets: &[MonitoringTarget]) -> anyhow::Result<Vec<Notification>>;
}
