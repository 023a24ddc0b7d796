//! CLI command implementations, one module per verb group.

pub mod diagnose;
pub mod feedback;
pub mod inspect;
pub mod observe;
pub mod pipeline;
pub mod policy;
pub mod recommend;
pub mod services;
pub mod status;
pub mod store;
pub mod submit;

use indexmap::IndexMap;

use crate::cli::output::OutputFormatter;
use crate::errors::{KernelError, KernelResult};
use crate::types::{DeliveryBundle, RunOutcome, RunSummary};

/// Parse repeated `key=value` flags; values parse as JSON when they can,
/// strings otherwise.
pub fn parse_params(pairs: &[String]) -> KernelResult<IndexMap<String, serde_json::Value>> {
    let mut params = IndexMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            KernelError::Config(format!("parameter '{}' is not key=value", pair))
        })?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Stable exit code for a surfaced error.
pub fn exit_code_for_error(error: &KernelError) -> i32 {
    match error {
        KernelError::Config(_)
        | KernelError::UnknownRun(_)
        | KernelError::UnknownService(_)
        | KernelError::UnknownSnapshot(_)
        | KernelError::ContractLint { .. } => 2,
        KernelError::Attempt { kind, .. } => kind.exit_code(),
        _ => 12,
    }
}

/// Stable exit code for a sealed run.
pub fn exit_code_for_summary(summary: &RunSummary) -> i32 {
    match summary.outcome {
        RunOutcome::Succeeded | RunOutcome::ClarificationNeeded => 0,
        _ => summary.last_error.map(|k| k.exit_code()).unwrap_or(12),
    }
}

pub fn print_summary(out: &OutputFormatter, summary: &RunSummary) {
    out.section("Run");
    out.kv("run_id", &summary.run_id);
    out.kv("outcome", summary.outcome.as_str());
    if let Some(strategy) = &summary.chosen_strategy {
        out.kv("chosen_strategy", strategy);
    }
    out.kv("attempts", &summary.attempts_count.to_string());
    out.kv("total_latency_ms", &summary.total_latency_ms.to_string());
    if let Some(kind) = summary.last_error {
        out.kv("last_error", kind.as_str());
    }
}

pub fn print_bundle(out: &OutputFormatter, bundle: &DeliveryBundle) {
    out.section("Delivery");
    out.kv("headline", &bundle.headline);
    if let Some(why) = &bundle.why_failed {
        out.kv("why_failed", why);
    }
    for question in &bundle.clarification_questions {
        out.kv("question", question);
    }
    for assumption in &bundle.assumptions {
        out.kv("assumption", assumption);
    }
    if let Some(artifact) = &bundle.primary_artifact {
        out.kv(
            "primary_artifact",
            &format!("{} ({})", artifact.uri, artifact.kind.as_str()),
        );
    }
    for artifact in &bundle.supporting_artifacts {
        out.kv(
            "supporting_artifact",
            &format!("{} ({})", artifact.uri, artifact.kind.as_str()),
        );
    }
    if !bundle.retry_options.is_empty() {
        let options: Vec<&str> = bundle
            .retry_options
            .iter()
            .map(|o| match o {
                crate::types::RetryOption::Strict => "strict",
                crate::types::RetryOption::Adaptive => "adaptive",
                crate::types::RetryOption::AllowHighRiskOnce => "allow_high_risk_once",
            })
            .collect();
        out.kv("retry_options", &options.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use chrono::Utc;

    #[test]
    fn parse_params_accepts_json_and_plain_values() {
        let params = parse_params(&[
            "dataset=sales_2026".to_string(),
            "limit=10".to_string(),
            "flags={\"a\":true}".to_string(),
        ])
        .unwrap();
        assert_eq!(params["dataset"], serde_json::json!("sales_2026"));
        assert_eq!(params["limit"], serde_json::json!(10));
        assert_eq!(params["flags"]["a"], serde_json::json!(true));

        assert!(parse_params(&["broken".to_string()]).is_err());
    }

    #[test]
    fn exit_codes_follow_the_documented_table() {
        let mut summary = RunSummary {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            outcome: RunOutcome::Succeeded,
            chosen_strategy: None,
            attempts_count: 1,
            total_latency_ms: 0,
            delivery_bundle_ref: None,
            last_error: None,
            sealed_at: Utc::now(),
        };
        assert_eq!(exit_code_for_summary(&summary), 0);

        summary.outcome = RunOutcome::Failed;
        summary.last_error = Some(ErrorKind::ApprovalRequired);
        assert_eq!(exit_code_for_summary(&summary), 13);

        summary.last_error = Some(ErrorKind::GovernanceBlock);
        assert_eq!(exit_code_for_summary(&summary), 10);

        summary.last_error = None;
        assert_eq!(exit_code_for_summary(&summary), 12);

        let err = KernelError::attempt(ErrorKind::Backpressure, "full");
        assert_eq!(exit_code_for_error(&err), 15);
        assert_eq!(exit_code_for_error(&KernelError::Config("x".into())), 2);
    }
}
