//! `aos recommend` - run the policy tuner: evaluate, classify, propose.

use clap::Args;

use crate::cli::CliContext;
use crate::errors::KernelResult;

#[derive(Debug, Args)]
pub struct RecommendArgs {
    /// Apply the proposals as a reversible override snapshot.
    #[arg(long)]
    pub apply: bool,

    /// Recorded as the approver on applied snapshots.
    #[arg(long, default_value = "operator")]
    pub approved_by: String,
}

pub async fn execute(ctx: &CliContext, args: RecommendArgs) -> KernelResult<i32> {
    let tuner = ctx.tuner()?;
    let apply = args.apply && !ctx.dry_run;
    let report = tuner.run(apply, &args.approved_by)?;

    ctx.output.json(&report);

    ctx.output.section("Evaluations");
    for record in &report.evaluations {
        ctx.output.kv(
            &format!(
                "{} ({})",
                record.strategy_id,
                record.task_kind.map(|k| k.as_str()).unwrap_or("all")
            ),
            &format!(
                "health {:.2}, success {:.0}%, p95 {}ms, {} samples -> {:?}",
                record.health_score,
                record.success_rate * 100.0,
                record.p95_latency_ms,
                record.samples,
                record.recommendation
            ),
        );
    }

    ctx.output.section("Proposals");
    if report.proposals.is_empty() {
        ctx.output.kv("none", "no action clears the priority bar");
    }
    for proposal in &report.proposals {
        ctx.output
            .kv(&format!("{:.2}", proposal.priority), &proposal.reason);
    }

    match &report.applied_snapshot {
        Some(snapshot) => ctx.output.success(&format!("applied as snapshot {}", snapshot)),
        None => {
            if args.apply && ctx.dry_run {
                ctx.output.warn("dry-run: proposals written to the plan file, nothing applied");
            } else if !args.apply {
                ctx.output
                    .warn("plan file written; re-run with --apply to take effect");
            }
        }
    }
    Ok(0)
}
