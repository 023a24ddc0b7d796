//! `aos submit` - accept a task and drive it to a sealed summary.

use clap::Args;

use crate::cli::commands::{exit_code_for_error, exit_code_for_summary, parse_params, print_bundle, print_summary};
use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::kernel::SubmitRequest;
use crate::types::{Origin, Profile, TaskKind};

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// The task, in natural language.
    pub text: String,

    /// Governance profile: strict | adaptive | auto.
    #[arg(long)]
    pub profile: Option<Profile>,

    /// Explicit parameter, repeatable: --param dataset=sales_2026.
    #[arg(long = "param", short = 'p')]
    pub params: Vec<String>,

    /// Pin the task kind instead of classifying the text.
    #[arg(long)]
    pub kind: Option<String>,
}

pub async fn execute(ctx: &CliContext, args: SubmitArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let request = SubmitRequest {
        text: args.text.clone(),
        profile: args.profile,
        origin: Origin::Cli,
        params: parse_params(&args.params)?,
        kind: args.kind.as_deref().map(TaskKind::from_str_loose),
    };

    if ctx.dry_run {
        let (task, run_ctx, plan) = kernel.plan_preview(&request)?;
        ctx.output.json(&plan);
        ctx.output.section("Plan preview");
        ctx.output.kv("task_kind", task.task_kind.as_str());
        ctx.output.kv("profile", run_ctx.profile.as_str());
        ctx.output.kv("ambiguous", &plan.ambiguous.to_string());
        for (i, candidate) in plan.candidates.iter().enumerate() {
            ctx.output.kv(
                &format!("candidate[{}]", i),
                &format!(
                    "{} (composite {:.3}, base {:.2}, memory {:.2}, {}/{})",
                    candidate.strategy_id,
                    candidate.composite_score,
                    candidate.base_score,
                    candidate.memory_score,
                    candidate.risk_level.as_str(),
                    candidate.maturity.as_str()
                ),
            );
        }
        return Ok(0);
    }

    let run_id = match kernel.submit(request) {
        Ok(run_id) => run_id,
        Err(error) => {
            ctx.output.error(&error.to_string());
            return Ok(exit_code_for_error(&error));
        }
    };
    ctx.output.success(&format!("accepted as {}", run_id));

    let summary = kernel.wait(&run_id).await?;
    if let Some((_, bundle)) = kernel.store().sealed_summary(&run_id)? {
        ctx.output.json(&serde_json::json!({
            "summary": summary,
            "bundle": bundle,
        }));
        print_summary(&ctx.output, &summary);
        print_bundle(&ctx.output, &bundle);
    }
    Ok(exit_code_for_summary(&summary))
}
