//! `aos policy` - show, apply and roll back override snapshots.

use clap::Subcommand;
use std::path::PathBuf;

use crate::cli::commands::exit_code_for_error;
use crate::cli::CliContext;
use crate::errors::{KernelError, KernelResult};
use crate::store::snapshots::diff_sets;
use crate::store::OverrideChange;
use crate::types::OverrideScope;

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Active override set, or the set recorded at a snapshot.
    Show {
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Apply override changes as a new snapshot.
    Apply {
        /// Repeatable: --set strategy:web.fetch.execution_mode=advisor
        /// (value `null` removes the entry).
        #[arg(long = "set")]
        sets: Vec<String>,
        /// JSON file with an array of {scope, key, value} changes.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "operator")]
        approved_by: String,
    },
    /// Restore the override set recorded at a snapshot; prints the diff.
    Rollback {
        snapshot_id: String,
        #[arg(long, default_value = "operator")]
        approved_by: String,
    },
}

fn parse_set(raw: &str) -> KernelResult<OverrideChange> {
    let (scope, rest) = raw
        .split_once(':')
        .ok_or_else(|| KernelError::Config(format!("'{}' is not scope:key=value", raw)))?;
    let (key, value) = rest
        .split_once('=')
        .ok_or_else(|| KernelError::Config(format!("'{}' is not scope:key=value", raw)))?;
    let scope = match scope {
        "profile" => OverrideScope::Profile,
        "strategy" => OverrideScope::Strategy,
        "task_kind" => OverrideScope::TaskKind,
        other => {
            return Err(KernelError::Config(format!(
                "unknown scope '{}' (profile | strategy | task_kind)",
                other
            )))
        }
    };
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok(OverrideChange {
        scope,
        key: key.to_string(),
        value,
    })
}

pub async fn execute(ctx: &CliContext, command: PolicyCommand) -> KernelResult<i32> {
    let kernel = ctx.kernel()?;
    let snapshots = kernel.store().snapshots();

    match command {
        PolicyCommand::Show { snapshot } => {
            let set = match &snapshot {
                Some(id) => match snapshots.get(id)? {
                    Some(snap) => snap.overrides,
                    None => {
                        let error = KernelError::UnknownSnapshot(id.clone());
                        ctx.output.error(&error.to_string());
                        return Ok(exit_code_for_error(&error));
                    }
                },
                None => snapshots.active_set()?,
            };
            ctx.output.json(&set);
            let title = match &snapshot {
                Some(id) => format!("Overrides at {}", id),
                None => "Active overrides".to_string(),
            };
            ctx.output.section(&title);
            if set.is_empty() {
                ctx.output.kv("none", "no overrides in effect");
            }
            for entry in &set {
                ctx.output.kv(
                    &format!("{:?}:{}", entry.scope, entry.key),
                    &format!("{} (snapshot {})", entry.value, entry.snapshot_id),
                );
            }
            Ok(0)
        }
        PolicyCommand::Apply { sets, file, approved_by } => {
            let mut changes = Vec::new();
            for raw in &sets {
                changes.push(parse_set(raw)?);
            }
            if let Some(path) = file {
                let raw = std::fs::read_to_string(&path)?;
                let from_file: Vec<OverrideChange> = serde_json::from_str(&raw)?;
                changes.extend(from_file);
            }
            if changes.is_empty() {
                let error = KernelError::Config("no changes given (--set or --file)".into());
                ctx.output.error(&error.to_string());
                return Ok(exit_code_for_error(&error));
            }
            if ctx.dry_run {
                ctx.output.json(&changes);
                ctx.output.warn(&format!(
                    "dry-run: {} change(s) validated, nothing applied",
                    changes.len()
                ));
                return Ok(0);
            }
            let snapshot = snapshots.apply(&changes, &approved_by)?;
            ctx.output.json(&snapshot);
            ctx.output
                .success(&format!("applied as snapshot {}", snapshot.snapshot_id));
            Ok(0)
        }
        PolicyCommand::Rollback { snapshot_id, approved_by } => {
            if ctx.dry_run {
                let target = snapshots.get(&snapshot_id)?;
                match target {
                    Some(snap) => {
                        let diff = diff_sets(&snapshots.active_set()?, &snap.overrides);
                        ctx.output.json(&diff);
                        ctx.output.warn("dry-run: diff shown, nothing rolled back");
                        Ok(0)
                    }
                    None => {
                        let error = KernelError::UnknownSnapshot(snapshot_id);
                        ctx.output.error(&error.to_string());
                        Ok(exit_code_for_error(&error))
                    }
                }
            } else {
                match snapshots.rollback(&snapshot_id, &approved_by) {
                    Ok((snapshot, diff)) => {
                        ctx.output.json(&serde_json::json!({
                            "snapshot": snapshot,
                            "diff": diff,
                        }));
                        ctx.output.section("Rollback diff");
                        for entry in &diff.added {
                            ctx.output.kv("restored", &format!("{} = {}", entry.key, entry.value));
                        }
                        for entry in &diff.removed {
                            ctx.output.kv("removed", &format!("{} = {}", entry.key, entry.value));
                        }
                        ctx.output
                            .success(&format!("rolled back to {}", snapshot_id));
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
}
