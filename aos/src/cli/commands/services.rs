//! `aos services` - list registered capabilities and call one directly.

use clap::Subcommand;

use crate::cli::commands::{exit_code_for_error, parse_params};
use crate::cli::CliContext;
use crate::errors::KernelResult;

#[derive(Debug, Subcommand)]
pub enum ServicesCommand {
    /// All registered services with contract summaries.
    List,
    /// Invoke one service through the same wrapper the engine uses.
    Call {
        name: String,
        /// Repeatable: --param url=https://example.com
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
}

pub async fn execute(ctx: &CliContext, command: ServicesCommand) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    match command {
        ServicesCommand::List => {
            let services = kernel.registry().list()?;
            ctx.output.json(&services);
            ctx.output.section("Services");
            for service in &services {
                ctx.output.kv(
                    &service.name,
                    &format!(
                        "v{} {} {}/{} layer={}{}",
                        service.version,
                        service.contract.execution_mode.as_str(),
                        service.risk_level.as_str(),
                        service.maturity.as_str(),
                        service.layer,
                        if service.lint_problems.is_empty() {
                            String::new()
                        } else {
                            format!(" (lint: {})", service.lint_problems.len())
                        }
                    ),
                );
            }
            Ok(0)
        }
        ServicesCommand::Call { name, params } => {
            let result = kernel
                .governance()
                .governed_call(
                    kernel.registry(),
                    &name,
                    &parse_params(&params)?,
                    format!("call-{}", uuid::Uuid::new_v4()),
                    "cli".to_string(),
                    ctx.dry_run,
                )
                .await;

            match result {
                Ok(output) => {
                    ctx.output.json(&output);
                    ctx.output.success(&format!("{} returned", name));
                    ctx.output.kv("value", &output.value.to_string());
                    for artifact in &output.artifacts {
                        ctx.output.kv("artifact", &artifact.uri);
                    }
                    Ok(0)
                }
                Err(error) => {
                    ctx.output.error(&error.to_string());
                    Ok(exit_code_for_error(&error))
                }
            }
        }
    }
}
