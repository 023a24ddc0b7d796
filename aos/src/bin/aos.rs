//! AOS operator CLI.
//!
//! # Usage
//!
//! ```bash
//! # Submit a task and wait for the delivery bundle
//! aos submit "请生成本季度增长复盘框架"
//!
//! # Inspect a run's evidence trail
//! aos inspect run-5f0c…
//!
//! # Health aggregates and the breaker dashboard
//! aos observe --window-days 7
//!
//! # Learning loop
//! aos feedback add run-5f0c… +1
//! aos recommend --apply
//! aos policy rollback snap-…
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use aos::cli::commands::{
    self, exit_code_for_error, feedback::FeedbackCommand, policy::PolicyCommand,
    services::ServicesCommand, store::StoreCommand,
};
use aos::cli::{CliContext, OutputFormat};

#[derive(Parser)]
#[command(name = "aos")]
#[command(version)]
#[command(about = "AOS - single-operator agent operating system", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (default: ./aos.toml or $AOS_CONFIG).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format (table, json, plain).
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Suppress status messages.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Extra detail (reflection records in inspect, debug output).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Validate and preview without side effects.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and wait for its delivery bundle.
    Submit(commands::submit::SubmitArgs),

    /// Pending or sealed summary for one run.
    Status(commands::status::StatusArgs),

    /// Full evidence trail of one run.
    Inspect(commands::inspect::InspectArgs),

    /// Failure TopN, SLO adherence, breaker dashboard.
    Observe(commands::observe::ObserveArgs),

    /// Run the policy tuner.
    Recommend(commands::recommend::RecommendArgs),

    /// Rate runs and inspect feedback stats.
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommand,
    },

    /// Show, apply or roll back policy overrides.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Capability registry operations.
    Services {
        #[command(subcommand)]
        command: ServicesCommand,
    },

    /// Severity-ranked system walk.
    Diagnose(commands::diagnose::DiagnoseArgs),

    /// Execute a declarative pipeline file.
    Pipeline(commands::pipeline::PipelineArgs),

    /// Evidence backup and restore.
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let ctx = match CliContext::new(cli.config, cli.format, cli.quiet, cli.verbose, cli.dry_run) {
        Ok(ctx) => ctx,
        Err(error) => {
            eprintln!("✗ {}", error);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Submit(args) => commands::submit::execute(&ctx, args).await,
        Commands::Status(args) => commands::status::execute(&ctx, args).await,
        Commands::Inspect(args) => commands::inspect::execute(&ctx, args).await,
        Commands::Observe(args) => commands::observe::execute(&ctx, args).await,
        Commands::Recommend(args) => commands::recommend::execute(&ctx, args).await,
        Commands::Feedback { command } => commands::feedback::execute(&ctx, command).await,
        Commands::Policy { command } => commands::policy::execute(&ctx, command).await,
        Commands::Services { command } => commands::services::execute(&ctx, command).await,
        Commands::Diagnose(args) => commands::diagnose::execute(&ctx, args).await,
        Commands::Pipeline(args) => commands::pipeline::execute(&ctx, args).await,
        Commands::Store { command } => commands::store::execute(&ctx, command).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            ctx.output.error(&error.to_string());
            std::process::exit(exit_code_for_error(&error));
        }
    }
}
