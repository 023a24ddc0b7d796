//! `aos pipeline` - run a declarative multi-step file.

use clap::Args;
use std::path::PathBuf;

use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::mcp::{execute_pipeline, PipelineFile};

#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Pipeline file (.json, .toml, .yaml).
    pub file: PathBuf,
}

pub async fn execute(ctx: &CliContext, args: PipelineArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let file = PipelineFile::load(&args.file)?;
    let report = execute_pipeline(
        &file,
        kernel.registry(),
        kernel.governance(),
        ctx.dry_run,
    )
    .await?;

    ctx.output.json(&report);
    ctx.output.section(&format!("Pipeline {}", report.pipeline_id));
    for step in &report.steps {
        ctx.output.kv(
            &format!("[{}] {}", step.step, step.service),
            &format!(
                "{} in {}ms{}",
                step.status,
                step.latency_ms,
                step.error
                    .as_ref()
                    .map(|e| format!(" - {}", e))
                    .unwrap_or_default()
            ),
        );
    }

    if report.aborted {
        ctx.output.error("pipeline aborted on step failure");
        Ok(12)
    } else {
        ctx.output.success("pipeline completed");
        Ok(0)
    }
}
