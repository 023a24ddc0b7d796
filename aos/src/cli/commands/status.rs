//! `aos status` - pending or sealed summary for one run.

use clap::Args;

use crate::cli::commands::{exit_code_for_error, print_summary};
use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::types::RunStatus;

#[derive(Debug, Args)]
pub struct StatusArgs {
    pub run_id: String,
}

pub async fn execute(ctx: &CliContext, args: StatusArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    match kernel.status(&args.run_id) {
        Ok(RunStatus::Pending) => {
            ctx.output.json(&serde_json::json!({"state": "pending"}));
            ctx.output.line("pending");
            Ok(0)
        }
        Ok(RunStatus::Running) => {
            ctx.output.json(&serde_json::json!({"state": "running"}));
            ctx.output.line("running");
            Ok(0)
        }
        Ok(RunStatus::Sealed { summary }) => {
            ctx.output.json(&summary);
            print_summary(&ctx.output, &summary);
            Ok(0)
        }
        Err(error) => {
            ctx.output.error(&error.to_string());
            Ok(exit_code_for_error(&error))
        }
    }
}
