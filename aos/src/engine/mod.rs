//! Autonomy engine: drives an execution plan candidate by candidate.
//!
//! The loop re-checks governance before every attempt (policy may have
//! changed since the plan was built), binds inputs, invokes under a
//! deadline, classifies failures into the stable error taxonomy, and
//! advances the fallback pointer until a candidate succeeds, a fatal error
//! aborts the run, or the plan is exhausted. Every attempt is persisted
//! before the next one begins.

pub mod queue;

use chrono::Utc;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AosConfig;
use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::governance::GovernanceKernel;
use crate::observability::Telemetry;
use crate::ranker::Ranker;
use crate::registry::{ServiceOutput, ServiceRegistry};
use crate::store::StateStore;
use crate::types::{
    ArtifactRef, AttemptStatus, AttemptTelemetry, DeliveryBundle, ExecutionAttempt,
    ExecutionPlan, Reflection, RetryOption, RunContext, RunOutcome, RunSummary,
    StrategyCandidate, TaskSpec,
};

/// At most this many clarification questions leave the engine per run.
const MAX_CLARIFICATIONS: usize = 2;

pub struct Engine {
    config: Arc<AosConfig>,
    store: Arc<StateStore>,
    registry: Arc<ServiceRegistry>,
    governance: Arc<GovernanceKernel>,
    ranker: Arc<Ranker>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish()
    }
}

struct CandidateOutcome {
    status: AttemptStatus,
    error: Option<KernelError>,
    output: Option<ServiceOutput>,
    assumptions: Vec<String>,
}

impl Engine {
    pub fn new(
        config: Arc<AosConfig>,
        store: Arc<StateStore>,
        registry: Arc<ServiceRegistry>,
        governance: Arc<GovernanceKernel>,
        ranker: Arc<Ranker>,
    ) -> Self {
        let telemetry = Telemetry::new(Arc::clone(&store));
        Self {
            config,
            store,
            registry,
            governance,
            ranker,
            telemetry,
        }
    }

    pub fn plan(&self, ctx: &RunContext, task: &TaskSpec) -> KernelResult<ExecutionPlan> {
        self.ranker.plan(ctx, task)
    }

    /// Execute one run end to end and seal its summary.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, trace_id = %ctx.trace_id))]
    pub async fn run(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        cancel: Arc<AtomicBool>,
    ) -> KernelResult<RunSummary> {
        let run_started = Instant::now();
        let plan = self.ranker.plan(ctx, task)?;
        self.store.record_plan(&plan)?;
        self.telemetry.emit(
            "engine",
            "plan",
            if plan.ambiguous { "ambiguous" } else { "ok" },
            Some(&ctx.run_id),
            Some(&ctx.trace_id),
            None,
            None,
        );

        // Clarification short-circuit: structurally missing high-value inputs
        // on the leading candidate become questions, not a doomed attempt.
        if let Some(first) = plan.candidates.first() {
            let questions = missing_high_value_questions(first, &task.explicit_params);
            if !questions.is_empty() {
                return self.seal_clarification(task, ctx, run_started, questions);
            }
        }

        let mut attempts: Vec<ExecutionAttempt> = Vec::new();
        let mut last_error: Option<(ErrorKind, String)> = None;
        let mut fatal: Option<(ErrorKind, String)> = None;
        let mut cancelled = false;

        for (position, candidate) in plan.candidates.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let attempt_started = Utc::now();
            let attempt_timer = Instant::now();
            let outcome = self.try_candidate(task, ctx, candidate).await;
            let latency_ms = attempt_timer.elapsed().as_millis() as u64;

            let (artifacts, advisory, retries, tool_fallbacks) = match &outcome.output {
                Some(output) => (
                    output.artifacts.clone(),
                    output.advisory,
                    output.retries,
                    output.tool_fallbacks,
                ),
                None => (Vec::new(), false, 0, 0),
            };
            let assumptions = outcome.assumptions.clone();

            let error_kind = outcome.error.as_ref().and_then(|e| e.error_kind());
            let error_message = outcome.error.as_ref().map(|e| e.to_string());
            let attempt = ExecutionAttempt {
                attempt_id: format!("att-{}", Uuid::new_v4()),
                run_id: ctx.run_id.clone(),
                strategy_id: candidate.strategy_id.clone(),
                position,
                started_at: attempt_started,
                ended_at: Utc::now(),
                status: outcome.status,
                error_kind,
                error_message: error_message.clone(),
                artifacts,
                advisory,
                telemetry: AttemptTelemetry {
                    latency_ms,
                    retries,
                    fallbacks_used: position as u32 + tool_fallbacks,
                },
                reflection: build_reflection(candidate, position, &outcome),
            };
            // Persisted before the next attempt may begin.
            self.store.record_attempt(&attempt, task.task_kind)?;
            self.telemetry.emit(
                "engine",
                "attempt",
                attempt.status.as_str(),
                Some(&ctx.run_id),
                Some(&ctx.trace_id),
                Some(latency_ms),
                error_kind.map(|k| k.as_str()),
            );
            attempts.push(attempt);

            match outcome.status {
                AttemptStatus::Succeeded => {
                    let output = outcome.output.unwrap_or_default();
                    return self.seal_success(
                        task,
                        ctx,
                        run_started,
                        attempts,
                        candidate,
                        output,
                        assumptions,
                        plan.ambiguous,
                    );
                }
                AttemptStatus::Aborted => {
                    fatal = Some((
                        error_kind.unwrap_or(ErrorKind::InternalError),
                        error_message.unwrap_or_else(|| "aborted".into()),
                    ));
                    break;
                }
                AttemptStatus::Failed | AttemptStatus::Skipped => {
                    if let Some(kind) = error_kind {
                        last_error = Some((
                            kind,
                            error_message.unwrap_or_else(|| kind.as_str().to_string()),
                        ));
                    } else if outcome.output.is_some() {
                        last_error = Some((
                            ErrorKind::ContractViolation,
                            "candidate produced only a partial, advisory result".into(),
                        ));
                    }
                }
            }
        }

        // No candidate succeeded.
        let outcome = if cancelled {
            RunOutcome::Aborted
        } else if fatal.is_some() {
            RunOutcome::Aborted
        } else if attempts.iter().any(|a| a.advisory && !a.artifacts.is_empty()) {
            RunOutcome::Degraded
        } else {
            RunOutcome::Failed
        };
        let why = if cancelled {
            Some((ErrorKind::InternalError, "run cancelled by operator".into()))
        } else {
            fatal.or(last_error)
        };
        self.seal_terminal(task, ctx, run_started, attempts, outcome, why)
    }

    async fn try_candidate(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        candidate: &StrategyCandidate,
    ) -> CandidateOutcome {
        // Exec-time governance gate, re-verified after plan time.
        if let Err(error) = self.governance.gate_candidate(candidate, ctx) {
            return skipped(error);
        }

        // Assumption notes for applied high-value defaults; an unknown
        // service surfaces through the governed call below instead.
        let assumptions = match self.registry.service(&candidate.service_binding.service) {
            Ok(Some(descriptor)) => {
                assumed_defaults(&descriptor.contract.inputs, &task.explicit_params)
            }
            _ => Vec::new(),
        };

        let mut provided = task.explicit_params.clone();
        provided
            .entry("text".to_string())
            .or_insert_with(|| serde_json::Value::String(task.text.clone()));

        // Binding, safety scan, decision gates and approval all run inside
        // the shared governed sequence; the match below only classifies the
        // outcome into attempt status.
        let deadline = Duration::from_secs(self.config.engine.attempt_deadline_secs);
        let call = self.governance.governed_call(
            &self.registry,
            &candidate.service_binding.service,
            &provided,
            ctx.run_id.clone(),
            ctx.trace_id.clone(),
            false,
        );

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(output)) => {
                if output.advisory {
                    // Partial result: keep the artifacts, advance the
                    // fallback pointer.
                    CandidateOutcome {
                        status: AttemptStatus::Failed,
                        error: None,
                        output: Some(output),
                        assumptions,
                    }
                } else {
                    CandidateOutcome {
                        status: AttemptStatus::Succeeded,
                        error: None,
                        output: Some(output),
                        assumptions,
                    }
                }
            }
            Ok(Err(error)) => {
                let kind = error.error_kind().unwrap_or(ErrorKind::InternalError);
                if kind.is_fatal() {
                    CandidateOutcome {
                        status: AttemptStatus::Aborted,
                        error: Some(error),
                        output: None,
                        assumptions,
                    }
                } else if kind.is_skip() {
                    skipped(error)
                } else {
                    failed(error)
                }
            }
            Err(_) => failed(KernelError::transient(
                ErrorKind::ToolTimeout,
                format!(
                    "attempt exceeded the {}s deadline",
                    self.config.engine.attempt_deadline_secs
                ),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn seal_success(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        run_started: Instant,
        attempts: Vec<ExecutionAttempt>,
        candidate: &StrategyCandidate,
        output: ServiceOutput,
        mut assumptions: Vec<String>,
        ambiguous: bool,
    ) -> KernelResult<RunSummary> {
        let mut artifacts = output.artifacts.clone();
        let primary = if artifacts.is_empty() {
            None
        } else {
            Some(artifacts.remove(0))
        };
        assumptions.extend(output.assumptions.clone());
        if ambiguous {
            assumptions.push(
                "top two strategies scored within the ambiguity threshold".to_string(),
            );
        }

        let headline = match &primary {
            Some(artifact) => format!(
                "Done: {} produced a {} artifact ({}).",
                candidate.strategy_id,
                artifact.kind.as_str(),
                &artifact.sha256[..12.min(artifact.sha256.len())]
            ),
            None => format!("Done: {} completed without artifacts.", candidate.strategy_id),
        };

        let bundle = DeliveryBundle {
            run_id: ctx.run_id.clone(),
            headline,
            clarification_questions: vec![],
            assumptions,
            primary_artifact: primary.clone(),
            supporting_artifacts: artifacts.clone(),
            why_failed: None,
            retry_options: vec![],
        };

        let mut referenced: Vec<ArtifactRef> = attempts
            .iter()
            .flat_map(|a| a.artifacts.iter().cloned())
            .collect();
        referenced.extend(primary.iter().cloned());

        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            task_id: task.task_id.clone(),
            outcome: RunOutcome::Succeeded,
            chosen_strategy: Some(candidate.strategy_id.clone()),
            attempts_count: attempts.len(),
            total_latency_ms: run_started.elapsed().as_millis() as u64,
            delivery_bundle_ref: None,
            last_error: None,
            sealed_at: Utc::now(),
        };
        let sealed = self.store.seal_run(summary, &bundle, &referenced)?;
        info!(run_id = %ctx.run_id, strategy = %candidate.strategy_id, "run succeeded");
        self.telemetry.emit(
            "engine",
            "seal",
            "succeeded",
            Some(&ctx.run_id),
            Some(&ctx.trace_id),
            Some(sealed.total_latency_ms),
            None,
        );
        Ok(sealed)
    }

    fn seal_terminal(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        run_started: Instant,
        attempts: Vec<ExecutionAttempt>,
        outcome: RunOutcome,
        why: Option<(ErrorKind, String)>,
    ) -> KernelResult<RunSummary> {
        let last_error = why.as_ref().map(|(kind, _)| *kind);
        let why_failed = why
            .as_ref()
            .map(|(kind, message)| format!("{}: {}", kind.as_str(), message));

        // Best advisory artifact, if any, still ships in the bundle.
        let advisory_artifact = attempts
            .iter()
            .rev()
            .filter(|a| a.advisory)
            .flat_map(|a| a.artifacts.first().cloned())
            .next();

        let headline = match outcome {
            RunOutcome::Degraded => {
                "Partial result only; the best advisory artifact is attached.".to_string()
            }
            RunOutcome::Aborted => "Run aborted before completion.".to_string(),
            _ => "No strategy could complete this task.".to_string(),
        };
        let mut retry_options = vec![RetryOption::Strict, RetryOption::Adaptive];
        if last_error == Some(ErrorKind::GovernanceBlock) {
            retry_options.push(RetryOption::AllowHighRiskOnce);
        }

        let bundle = DeliveryBundle {
            run_id: ctx.run_id.clone(),
            headline,
            clarification_questions: vec![],
            assumptions: vec![],
            primary_artifact: advisory_artifact.clone(),
            supporting_artifacts: vec![],
            why_failed,
            retry_options,
        };

        let referenced: Vec<ArtifactRef> = attempts
            .iter()
            .flat_map(|a| a.artifacts.iter().cloned())
            .collect();
        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            task_id: task.task_id.clone(),
            outcome,
            chosen_strategy: None,
            attempts_count: attempts.len(),
            total_latency_ms: run_started.elapsed().as_millis() as u64,
            delivery_bundle_ref: None,
            last_error,
            sealed_at: Utc::now(),
        };
        let sealed = self.store.seal_run(summary, &bundle, &referenced)?;
        warn!(run_id = %ctx.run_id, outcome = %outcome.as_str(), "run did not succeed");
        self.telemetry.emit(
            "engine",
            "seal",
            outcome.as_str(),
            Some(&ctx.run_id),
            Some(&ctx.trace_id),
            Some(sealed.total_latency_ms),
            last_error.map(|k| k.as_str()),
        );
        Ok(sealed)
    }

    fn seal_clarification(
        &self,
        task: &TaskSpec,
        ctx: &RunContext,
        run_started: Instant,
        questions: Vec<String>,
    ) -> KernelResult<RunSummary> {
        let bundle = DeliveryBundle {
            run_id: ctx.run_id.clone(),
            headline: "Two details are needed before this task can run.".to_string(),
            clarification_questions: questions.into_iter().take(MAX_CLARIFICATIONS).collect(),
            assumptions: vec![
                "resubmit with the answers as explicit parameters".to_string(),
            ],
            primary_artifact: None,
            supporting_artifacts: vec![],
            why_failed: None,
            retry_options: vec![],
        };
        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            task_id: task.task_id.clone(),
            outcome: RunOutcome::ClarificationNeeded,
            chosen_strategy: None,
            attempts_count: 0,
            total_latency_ms: run_started.elapsed().as_millis() as u64,
            delivery_bundle_ref: None,
            last_error: None,
            sealed_at: Utc::now(),
        };
        let sealed = self.store.seal_run(summary, &bundle, &[])?;
        self.telemetry.emit(
            "engine",
            "seal",
            "clarification_needed",
            Some(&ctx.run_id),
            Some(&ctx.trace_id),
            None,
            None,
        );
        Ok(sealed)
    }
}

fn skipped(error: KernelError) -> CandidateOutcome {
    CandidateOutcome {
        status: AttemptStatus::Skipped,
        error: Some(error),
        output: None,
        assumptions: vec![],
    }
}

fn failed(error: KernelError) -> CandidateOutcome {
    CandidateOutcome {
        status: AttemptStatus::Failed,
        error: Some(error),
        output: None,
        assumptions: vec![],
    }
}

fn missing_high_value_questions(
    candidate: &StrategyCandidate,
    provided: &IndexMap<String, serde_json::Value>,
) -> Vec<String> {
    candidate
        .required_inputs
        .iter()
        .filter(|p| p.required && p.high_value && p.default.is_none())
        .filter(|p| !provided.contains_key(&p.name))
        .filter_map(|p| p.question.clone())
        .take(MAX_CLARIFICATIONS)
        .collect()
}

fn assumed_defaults(
    inputs: &[crate::types::ParamSpec],
    provided: &IndexMap<String, serde_json::Value>,
) -> Vec<String> {
    inputs
        .iter()
        .filter(|p| p.high_value && p.default.is_some() && !provided.contains_key(&p.name))
        .map(|p| {
            format!(
                "assumed {} = {}",
                p.name,
                p.default.as_ref().map(|v| v.to_string()).unwrap_or_default()
            )
        })
        .collect()
}

fn build_reflection(
    candidate: &StrategyCandidate,
    position: usize,
    outcome: &CandidateOutcome,
) -> Reflection {
    let plan = format!(
        "candidate '{}' at position {} (composite {:.3})",
        candidate.strategy_id, position, candidate.composite_score
    );
    let execute = match outcome.status {
        AttemptStatus::Skipped => format!(
            "skipped before invocation: {}",
            outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default()
        ),
        _ => format!("invoked service '{}'", candidate.service_binding.service),
    };
    let verify = match outcome.status {
        AttemptStatus::Succeeded => "acceptance post-conditions held".to_string(),
        AttemptStatus::Failed => outcome
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "partial result only".to_string()),
        AttemptStatus::Skipped => "not invoked".to_string(),
        AttemptStatus::Aborted => "fatal policy failure".to_string(),
    };
    let improve = match outcome.status {
        AttemptStatus::Succeeded => "none required".to_string(),
        AttemptStatus::Aborted => "halt; no further candidates".to_string(),
        _ => "advance to the next ranked candidate".to_string(),
    };
    Reflection {
        plan,
        execute,
        verify,
        improve,
    }
}
