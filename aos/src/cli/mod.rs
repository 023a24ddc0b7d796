//! Operator command-line surface.
//!
//! # Verbs
//!
//! - `submit` - accept a task, execute it, print the delivery bundle
//! - `status` / `inspect` - run state and the full evidence trail
//! - `observe` - failure TopN, SLO adherence, breaker dashboard
//! - `recommend` - run the policy tuner (optionally `--apply`)
//! - `feedback add|stats` - rate runs, see ingestion stats
//! - `policy show|apply|rollback` - the reversible override log
//! - `services list|call` - the capability registry
//! - `diagnose` - severity-ranked system walk
//! - `pipeline <file>` - declarative multi-step execution
//! - `store backup|restore` - evidence backup with integrity manifest
//!
//! Exit codes are stable: 0 success, 2 usage error, 10 governance block,
//! 11 missing input, 12 service failure after retries, 13 approval
//! required, 14 policy violation, 15 backpressure.

pub mod commands;
pub mod context;
pub mod output;

pub use context::CliContext;
pub use output::{OutputFormat, OutputFormatter};
