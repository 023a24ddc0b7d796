//! `aos diagnose` - walk env, config, services, breakers, evidence integrity
//! and the last runs; print a severity-ranked report.

use clap::Args;

use crate::cli::CliContext;
use crate::errors::KernelResult;
use crate::observability::{self, Severity};

#[derive(Debug, Args)]
pub struct DiagnoseArgs {}

pub async fn execute(ctx: &CliContext, _args: DiagnoseArgs) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let findings = observability::diagnose(
        kernel.config(),
        kernel.store(),
        kernel.registry(),
        kernel.mcp(),
    )?;

    ctx.output.json(&findings);
    ctx.output.section("Diagnostics");
    for finding in &findings {
        ctx.output.kv(
            &format!("[{}] {}", finding.severity.as_str(), finding.area),
            &finding.message,
        );
    }

    let has_critical = findings.iter().any(|f| f.severity == Severity::Critical);
    Ok(if has_critical { 12 } else { 0 })
}
