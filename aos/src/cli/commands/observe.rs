//! `aos observe` - failure TopN, SLO adherence and the breaker dashboard.

use clap::Args;

use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::observability;

#[derive(Debug, Args)]
pub struct ObserveArgs {
    /// Aggregation window in days.
    #[arg(long, default_value_t = 7)]
    pub window_days: i64,

    /// List per-tool breaker state, consecutive failures and cooldown
    /// deadline from persisted state.
    #[arg(long)]
    pub breakers: bool,
}

pub async fn execute(ctx: &CliContext, args: ObserveArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let report = observability::observe(
        kernel.config(),
        kernel.store(),
        kernel.mcp(),
        args.window_days,
    )?;

    ctx.output.json(&report);

    ctx.output.section(&format!("Observability ({}d window)", report.window_days));
    ctx.output.kv("attempts", &report.attempts.to_string());
    ctx.output.kv(
        "success_rate",
        &format!(
            "{:.1}% (target {:.1}%, {})",
            report.success_rate * 100.0,
            report.slo_success_target * 100.0,
            if report.slo_success_met { "met" } else { "MISSED" }
        ),
    );
    ctx.output.kv(
        "p95_latency",
        &format!(
            "{}ms (target {}ms, {})",
            report.p95_latency_ms,
            report.slo_p95_target_ms,
            if report.slo_latency_met { "met" } else { "MISSED" }
        ),
    );

    if !report.failure_top.is_empty() {
        ctx.output.section("Failure hotspots");
        for (strategy, kind, count) in &report.failure_top {
            ctx.output.kv(strategy, &format!("{} x{}", kind, count));
        }
    }

    if args.breakers {
        ctx.output.section("Breakers");
        if report.breakers.is_empty() {
            ctx.output.kv("state", "no tools tracked yet");
        }
        for row in &report.breakers {
            let detail = match &row.cooldown_until {
                Some(until) => format!(
                    "{} ({} consecutive failures, cooldown until {})",
                    row.state,
                    row.consecutive_failures,
                    until.to_rfc3339()
                ),
                None if row.state == "half-open" => format!(
                    "half-open ({} consecutive failures, awaiting probe)",
                    row.consecutive_failures
                ),
                None => format!(
                    "{} ({} consecutive failures)",
                    row.state, row.consecutive_failures
                ),
            };
            ctx.output.kv(&row.tool_id, &detail);
        }
    }
    Ok(0)
}
