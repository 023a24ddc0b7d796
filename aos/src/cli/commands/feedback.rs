//! `aos feedback` - rate finished runs and show ingestion stats.

use clap::Subcommand;

use crate::cli::commands::exit_code_for_error;
use crate::cli::CliContext;
use crate::errors::{KernelError, KernelResult};

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    /// Record a +1/-1 rating for a run.
    Add {
        run_id: String,
        /// `+1` or `-1`.
        rating: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Ingestion statistics.
    Stats,
}

pub async fn execute(ctx: &CliContext, command: FeedbackCommand) -> KernelResult<i32> {
    let service = ctx.feedback_service()?;
    match command {
        FeedbackCommand::Add { run_id, rating, note } => {
            let rating: i8 = match rating.as_str() {
                "+1" | "1" => 1,
                "-1" => -1,
                other => {
                    let error =
                        KernelError::Config(format!("rating must be +1 or -1, got '{}'", other));
                    ctx.output.error(&error.to_string());
                    return Ok(exit_code_for_error(&error));
                }
            };
            if ctx.dry_run {
                ctx.output.warn("dry-run: feedback not recorded");
                return Ok(0);
            }
            match service.add(&run_id, rating, note) {
                Ok(record) => {
                    ctx.output.json(&record);
                    ctx.output.success(&format!("feedback recorded for {}", run_id));
                    Ok(0)
                }
                Err(error) => {
                    ctx.output.error(&error.to_string());
                    Ok(exit_code_for_error(&error))
                }
            }
        }
        FeedbackCommand::Stats => {
            let stats = service.stats()?;
            ctx.output.json(&stats);
            ctx.output.section("Feedback");
            ctx.output.kv("total", &stats.total.to_string());
            ctx.output.kv("positive", &stats.positive.to_string());
            ctx.output.kv("negative", &stats.negative.to_string());
            ctx.output.kv("unprocessed", &stats.unprocessed.to_string());
            Ok(0)
        }
    }
}
