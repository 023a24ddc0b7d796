//! Core entity types for the agent kernel.
//!
//! These are the records that flow between the planner, ranker, engine and
//! store: task specs, run contexts, strategy candidates, attempts, artifacts,
//! delivery bundles and the learning-loop records. Everything here is plain
//! data; behavior lives in the owning modules.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::ErrorKind;

pub type TaskId = String;
pub type RunId = String;
pub type AttemptId = String;
pub type StrategyId = String;
pub type SnapshotId = String;
pub type TraceId = String;

/// Classified kind of a user task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Presentation,
    Research,
    DataQuery,
    Image,
    Automation,
    Other,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Presentation => "presentation",
            TaskKind::Research => "research",
            TaskKind::DataQuery => "data-query",
            TaskKind::Image => "image",
            TaskKind::Automation => "automation",
            TaskKind::Other => "other",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "presentation" => TaskKind::Presentation,
            "research" => TaskKind::Research,
            "data-query" | "data_query" => TaskKind::DataQuery,
            "image" => TaskKind::Image,
            "automation" => TaskKind::Automation,
            _ => TaskKind::Other,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cli,
    Studio,
    Scheduler,
}

/// Named governance preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Strict,
    Adaptive,
    /// Resolved to `strict` or `adaptive` per task kind before a run binds.
    Auto,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Strict => "strict",
            Profile::Adaptive => "adaptive",
            Profile::Auto => "auto",
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Profile::Strict),
            "adaptive" => Ok(Profile::Adaptive),
            "auto" => Ok(Profile::Auto),
            other => Err(format!("unknown profile '{}'", other)),
        }
    }
}

/// Per-strategy risk tier. Ordering is ascending risk, so `a <= b` means
/// "a is no riskier than b".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Lifecycle tier of a capability. Ordering is ascending maturity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Maturity {
    Experimental,
    Beta,
    Stable,
}

impl Maturity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Maturity::Experimental => "experimental",
            Maturity::Beta => "beta",
            Maturity::Stable => "stable",
        }
    }
}

/// Immutable description of a user request. Created on ingress, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub text: String,
    pub task_kind: TaskKind,
    pub entered_at: DateTime<Utc>,
    pub origin: Origin,
    /// Free-form parameters supplied explicitly by the operator.
    #[serde(default)]
    pub explicit_params: IndexMap<String, serde_json::Value>,
}

/// Profile-bound execution envelope for one run. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// The resolved preset (`auto` never reaches a bound context).
    pub profile: Profile,
    pub allowed_layers: BTreeSet<String>,
    pub blocked_maturity: BTreeSet<Maturity>,
    pub max_risk_level: RiskLevel,
    pub deterministic: bool,
    pub learning_enabled: bool,
    pub max_fallback_steps: usize,
    pub trace_id: TraceId,
}

/// Named parameter in a capability's input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Closed value domain; `None` means free-form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// High-value inputs are worth a clarification question when absent.
    #[serde(default)]
    pub high_value: bool,
    /// Question to put to the operator when a high-value input is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl ParamSpec {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            description: String::new(),
            value_domain: None,
            default: None,
            high_value: false,
            question: None,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_default(mut self, v: serde_json::Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn high_value(mut self, question: &str) -> Self {
        self.high_value = true;
        self.question = Some(question.to_string());
        self
    }
}

/// Logical service bound by a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub service: String,
    pub version: String,
}

/// One way to satisfy a task, scored and ordered by the ranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub strategy_id: StrategyId,
    pub service_binding: ServiceBinding,
    /// Textual/keyword fit in `[0, 1]`; deterministic for a given task.
    pub base_score: f64,
    /// Historical success prior in `[0, 1]`.
    pub memory_score: f64,
    pub composite_score: f64,
    pub risk_level: RiskLevel,
    pub maturity: Maturity,
    pub required_layer: String,
    pub required_inputs: Vec<ParamSpec>,
    /// Set by the tuner; demoted strategies rank after everything else.
    #[serde(default)]
    pub demoted: bool,
}

/// Ordered candidate sequence for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub run_id: RunId,
    pub candidates: Vec<StrategyCandidate>,
    /// Strict-profile flag: top-two composite gap was under the threshold.
    pub ambiguous: bool,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Skipped => "skipped",
            AttemptStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptTelemetry {
    pub latency_ms: u64,
    pub retries: u32,
    pub fallbacks_used: u32,
}

/// Structured plan/execute/verify/improve record appended with every attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reflection {
    pub plan: String,
    pub execute: String,
    pub verify: String,
    pub improve: String,
}

/// Record of one candidate's invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_id: AttemptId,
    pub run_id: RunId,
    pub strategy_id: StrategyId,
    /// Zero-based position in the execution plan; attempts for a run form a
    /// strict prefix of the plan in this order.
    pub position: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Artifacts above are partial / advisory-grade (degraded outcome input).
    #[serde(default)]
    pub advisory: bool,
    pub telemetry: AttemptTelemetry,
    pub reflection: Reflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Json,
    Md,
    Html,
    Binary,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Json => "json",
            ArtifactKind::Md => "md",
            ArtifactKind::Html => "html",
            ArtifactKind::Binary => "binary",
        }
    }
}

/// Immutable reference into the content-addressed artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    pub kind: ArtifactKind,
    pub sha256: String,
    pub size_bytes: u64,
    pub produced_by: StrategyId,
}

/// Labelled retry presets offered back to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOption {
    Strict,
    Adaptive,
    AllowHighRiskOnce,
}

/// User-facing summary sealed with every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryBundle {
    pub run_id: RunId,
    pub headline: String,
    /// At most two questions per run.
    #[serde(default)]
    pub clarification_questions: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub supporting_artifacts: Vec<ArtifactRef>,
    /// error_kind plus a human summary for non-success runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_failed: Option<String>,
    #[serde(default)]
    pub retry_options: Vec<RetryOption>,
}

/// Terminal state of a run. A sum, not an exception: clarification is a
/// first-class outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Degraded,
    Failed,
    Aborted,
    ClarificationNeeded,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Degraded => "degraded",
            RunOutcome::Failed => "failed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::ClarificationNeeded => "clarification_needed",
        }
    }
}

/// Final terminal record for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_strategy: Option<StrategyId>,
    pub attempts_count: usize,
    pub total_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_bundle_ref: Option<ArtifactRef>,
    /// Last attempt-level error, surfaced in the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
    pub sealed_at: DateTime<Utc>,
}

/// Operator rating for a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub run_id: RunId,
    /// `+1` or `-1`.
    pub rating: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Promote,
    Demote,
    CollectMoreData,
}

/// Periodic strategy-level score over an evaluation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub strategy_id: StrategyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_kind: Option<TaskKind>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub success_rate: f64,
    pub p95_latency_ms: u64,
    pub fallback_rate: f64,
    pub health_score: f64,
    pub samples: u64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    Profile,
    Strategy,
    TaskKind,
}

/// One entry in the ordered, reversible override log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub scope: OverrideScope,
    pub key: String,
    pub value: serde_json::Value,
    pub snapshot_id: SnapshotId,
    pub applied_at: DateTime<Utc>,
    pub approved_by: String,
}

/// Immutable, addressable point in the override log. Each snapshot records
/// the complete effective override set after its action; apply and rollback
/// are both appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideSnapshot {
    pub snapshot_id: SnapshotId,
    pub applied_at: DateTime<Utc>,
    pub approved_by: String,
    /// `apply` or `rollback:<target-snapshot-id>`.
    pub action: String,
    /// Full effective override set once this snapshot is active.
    pub overrides: Vec<PolicyOverride>,
}

/// Unified telemetry event appended for every significant action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub ts: DateTime<Utc>,
    pub module: String,
    pub action: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Replayable record of one connector tool call, keyed by `run_id.step_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub run_id: RunId,
    pub step_id: String,
    pub server: String,
    pub tool: String,
    pub params: serde_json::Value,
    pub dry_run: bool,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
    pub ts: DateTime<Utc>,
}

/// Answer to `Kernel::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Sealed { summary: RunSummary },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_and_maturity_order_as_tiers() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(Maturity::Experimental < Maturity::Beta);
        assert!(Maturity::Beta < Maturity::Stable);
    }

    #[test]
    fn task_kind_round_trips_kebab_case() {
        let json = serde_json::to_string(&TaskKind::DataQuery).unwrap();
        assert_eq!(json, "\"data-query\"");
        let back: TaskKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskKind::DataQuery);
        assert_eq!(TaskKind::from_str_loose("data-query"), TaskKind::DataQuery);
        assert_eq!(TaskKind::from_str_loose("unknown"), TaskKind::Other);
    }

    #[test]
    fn attempt_serializes_error_kind_snake_case() {
        let attempt = ExecutionAttempt {
            attempt_id: "att-1".into(),
            run_id: "run-1".into(),
            strategy_id: "deck.outline".into(),
            position: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            status: AttemptStatus::Skipped,
            error_kind: Some(crate::errors::ErrorKind::GovernanceBlock),
            error_message: Some("maturity blocked".into()),
            artifacts: vec![],
            advisory: false,
            telemetry: AttemptTelemetry::default(),
            reflection: Reflection::default(),
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["error_kind"], "governance_block");
    }
}
