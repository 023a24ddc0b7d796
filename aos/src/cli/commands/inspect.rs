//! `aos inspect` - the full evidence trail of one run: plan, attempts with
//! telemetry and reflection records, tool-call chains and artifacts.

use clap::Args;
use serde::Serialize;

use crate::cli::commands::exit_code_for_error;
use crate::cli::CliContext;
use crate::errors::{KernelError, KernelResult};
use crate::store::RunEvent;
use crate::types::{DeliveryBundle, ExecutionAttempt, ExecutionPlan, RunSummary, ToolCallRecord};

#[derive(Debug, Args)]
pub struct InspectArgs {
    pub run_id: String,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    run_id: String,
    plan: Option<ExecutionPlan>,
    attempts: Vec<ExecutionAttempt>,
    tool_calls: Vec<ToolCallRecord>,
    summary: Option<RunSummary>,
    bundle: Option<DeliveryBundle>,
}

pub async fn execute(ctx: &CliContext, args: InspectArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let store = kernel.store();

    let events = store.run_events(&args.run_id)?;
    if events.is_empty() {
        let error = KernelError::UnknownRun(args.run_id.clone());
        ctx.output.error(&error.to_string());
        return Ok(exit_code_for_error(&error));
    }

    let mut report = InspectReport {
        run_id: args.run_id.clone(),
        plan: None,
        attempts: store.attempts_for_run(&args.run_id)?,
        tool_calls: store.tool_calls_for_run(&args.run_id)?,
        summary: None,
        bundle: None,
    };
    for event in events {
        match event {
            RunEvent::PlanBuilt { plan } => report.plan = Some(plan),
            RunEvent::Sealed { summary, bundle } => {
                report.summary = Some(summary);
                report.bundle = Some(bundle);
            }
            RunEvent::Submitted { .. } => {}
        }
    }

    ctx.output.json(&report);

    ctx.output.section(&format!("Run {}", report.run_id));
    if let Some(plan) = &report.plan {
        ctx.output.kv("plan", &format!("{} candidates, ambiguous={}", plan.candidates.len(), plan.ambiguous));
        for candidate in &plan.candidates {
            ctx.output.kv(
                "  candidate",
                &format!("{} (composite {:.3})", candidate.strategy_id, candidate.composite_score),
            );
        }
    }

    ctx.output.section("Attempts");
    for attempt in &report.attempts {
        ctx.output.kv(
            &format!("[{}] {}", attempt.position, attempt.strategy_id),
            &format!(
                "{}{} in {}ms, {} retries",
                attempt.status.as_str(),
                attempt
                    .error_kind
                    .map(|k| format!(" ({})", k.as_str()))
                    .unwrap_or_default(),
                attempt.telemetry.latency_ms,
                attempt.telemetry.retries
            ),
        );
        if ctx.verbose {
            ctx.output.kv("    plan", &attempt.reflection.plan);
            ctx.output.kv("    execute", &attempt.reflection.execute);
            ctx.output.kv("    verify", &attempt.reflection.verify);
            ctx.output.kv("    improve", &attempt.reflection.improve);
        }
        for artifact in &attempt.artifacts {
            ctx.output.kv(
                "    artifact",
                &format!("{} sha256={}", artifact.uri, &artifact.sha256[..12]),
            );
        }
    }

    if !report.tool_calls.is_empty() {
        ctx.output.section("Tool calls");
        for call in &report.tool_calls {
            ctx.output.kv(
                &format!("{}.{}", call.run_id, call.step_id),
                &format!(
                    "{}/{} succeeded={} in {}ms",
                    call.server, call.tool, call.succeeded, call.latency_ms
                ),
            );
        }
    }

    if let Some(summary) = &report.summary {
        ctx.output.section("Summary");
        ctx.output.kv("outcome", summary.outcome.as_str());
        if let Some(bundle_ref) = &summary.delivery_bundle_ref {
            ctx.output.kv("bundle", &bundle_ref.uri);
        }
    } else {
        ctx.output.kv("summary", "not sealed yet");
    }
    Ok(0)
}
