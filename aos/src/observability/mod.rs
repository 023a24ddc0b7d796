//! Unified telemetry, health aggregates and the diagnostics walk.
//!
//! Every significant action appends a [`TelemetryEvent`] to the evidence
//! store in addition to whatever `tracing` emits; the event log is what
//! `observe` and `diagnose` read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::config::AosConfig;
use crate::errors::KernelResult;
use crate::mcp::McpRuntime;
use crate::registry::ServiceRegistry;
use crate::store::{StateStore, WindowStats};
use crate::types::TelemetryEvent;

/// Append-only telemetry sink shared across components.
#[derive(Clone)]
pub struct Telemetry {
    store: Arc<StateStore>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish()
    }
}

impl Telemetry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Best-effort append; telemetry must never fail the action it records.
    pub fn emit(
        &self,
        module: &str,
        action: &str,
        status: &str,
        run_id: Option<&str>,
        trace_id: Option<&str>,
        latency_ms: Option<u64>,
        error_code: Option<&str>,
    ) {
        let event = TelemetryEvent {
            ts: Utc::now(),
            module: module.to_string(),
            action: action.to_string(),
            status: status.to_string(),
            trace_id: trace_id.map(|s| s.to_string()),
            run_id: run_id.map(|s| s.to_string()),
            latency_ms,
            error_code: error_code.map(|s| s.to_string()),
        };
        if let Err(e) = self.store.record_telemetry(&event) {
            warn!(error = %e, "failed to append telemetry event");
        }
    }
}

/// One row of the breaker dashboard, read from persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRow {
    pub tool_id: String,
    pub state: String,
    pub consecutive_failures: u32,
    /// When an open breaker becomes eligible for its half-open probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Aggregated view rendered by `observe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveReport {
    pub window_days: i64,
    pub attempts: u64,
    pub success_rate: f64,
    pub p95_latency_ms: u64,
    pub slo_success_target: f64,
    pub slo_p95_target_ms: u64,
    pub slo_success_met: bool,
    pub slo_latency_met: bool,
    /// (strategy_id, error_kind, count), worst first.
    pub failure_top: Vec<(String, String, u64)>,
    pub breakers: Vec<BreakerRow>,
}

pub fn observe(
    config: &AosConfig,
    store: &StateStore,
    mcp: &McpRuntime,
    window_days: i64,
) -> KernelResult<ObserveReport> {
    let since = Utc::now() - chrono::Duration::days(window_days);
    let aggregate: WindowStats = store.index().slo_aggregate(since)?;
    let failure_top = store.index().failure_hotspots(since, 10)?;

    let breaker_map = mcp.breakers();
    let mut breakers: Vec<BreakerRow> = breaker_map
        .snapshot()
        .into_iter()
        .map(|(tool_id, b)| BreakerRow {
            cooldown_until: breaker_map.cooldown_until(&b),
            tool_id,
            state: b.state.as_str().to_string(),
            consecutive_failures: b.consecutive_failures,
        })
        .collect();
    breakers.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));

    let success_rate = aggregate.success_rate();
    Ok(ObserveReport {
        window_days,
        attempts: aggregate.attempts,
        success_rate,
        p95_latency_ms: aggregate.p95_latency_ms,
        slo_success_target: config.slo.success_target,
        slo_p95_target_ms: config.slo.p95_target_ms,
        slo_success_met: aggregate.attempts == 0 || success_rate >= config.slo.success_target,
        slo_latency_met: aggregate.p95_latency_ms <= config.slo.p95_target_ms,
        failure_top,
        breakers,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticFinding {
    pub severity: Severity,
    pub area: String,
    pub message: String,
}

/// Walk env -> config -> services -> breaker state -> last N runs and return
/// a severity-ranked report (worst first).
pub fn diagnose(
    config: &AosConfig,
    store: &StateStore,
    registry: &ServiceRegistry,
    mcp: &McpRuntime,
) -> KernelResult<Vec<DiagnosticFinding>> {
    let mut findings = Vec::new();

    // Environment.
    if std::env::var("AOS_STORE_ROOT").is_ok() {
        findings.push(DiagnosticFinding {
            severity: Severity::Info,
            area: "env".into(),
            message: "AOS_STORE_ROOT overrides the configured store root".into(),
        });
    }
    if config.governance.approval_secret.is_none() {
        findings.push(DiagnosticFinding {
            severity: Severity::Warning,
            area: "config".into(),
            message: "no approval secret configured; publish steps will always be skipped".into(),
        });
    }

    // Config.
    if let Err(e) = config.validate() {
        findings.push(DiagnosticFinding {
            severity: Severity::Critical,
            area: "config".into(),
            message: e.to_string(),
        });
    }

    // Services.
    let services = registry.list()?;
    if services.is_empty() {
        findings.push(DiagnosticFinding {
            severity: Severity::Critical,
            area: "services".into(),
            message: "no services registered".into(),
        });
    }
    for service in &services {
        if !service.lint_problems.is_empty() {
            findings.push(DiagnosticFinding {
                severity: Severity::Warning,
                area: "services".into(),
                message: format!(
                    "service '{}' has contract lint findings: {}",
                    service.name,
                    service.lint_problems.join("; ")
                ),
            });
        }
        if let Some(fallback) = &service.contract.fallback {
            if registry.service(fallback)?.is_none() {
                findings.push(DiagnosticFinding {
                    severity: Severity::Warning,
                    area: "services".into(),
                    message: format!(
                        "service '{}' declares unknown fallback '{}'",
                        service.name, fallback
                    ),
                });
            }
        }
    }

    // Breakers.
    for (tool_id, breaker) in mcp.breakers().snapshot() {
        if breaker.state != crate::mcp::BreakerState::Closed {
            findings.push(DiagnosticFinding {
                severity: Severity::Warning,
                area: "breaker".into(),
                message: format!(
                    "tool '{}' breaker is {} ({} consecutive failures)",
                    tool_id,
                    breaker.state.as_str(),
                    breaker.consecutive_failures
                ),
            });
        }
    }

    // Evidence integrity.
    for (log, seq) in store.verify_integrity()? {
        findings.push(DiagnosticFinding {
            severity: Severity::Critical,
            area: "store".into(),
            message: format!("event log '{}' hash chain diverges at seq {}", log, seq),
        });
    }

    // Last runs.
    let recent = store.index().recent_runs(10)?;
    let failed = recent
        .iter()
        .filter(|r| matches!(r.outcome.as_deref(), Some("failed") | Some("aborted")))
        .count();
    if !recent.is_empty() && failed * 2 > recent.len() {
        findings.push(DiagnosticFinding {
            severity: Severity::Warning,
            area: "runs".into(),
            message: format!(
                "{} of the last {} runs failed or aborted",
                failed,
                recent.len()
            ),
        });
    }

    if findings.is_empty() {
        findings.push(DiagnosticFinding {
            severity: Severity::Info,
            area: "system".into(),
            message: "all checks passed".into(),
        });
    }
    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_critical_first_after_sort() {
        let mut findings = vec![
            DiagnosticFinding {
                severity: Severity::Info,
                area: "a".into(),
                message: "m".into(),
            },
            DiagnosticFinding {
                severity: Severity::Critical,
                area: "b".into(),
                message: "m".into(),
            },
            DiagnosticFinding {
                severity: Severity::Warning,
                area: "c".into(),
                message: "m".into(),
            },
        ];
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[2].severity, Severity::Info);
    }

    #[test]
    fn telemetry_emit_appends_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        let telemetry = Telemetry::new(Arc::clone(&store));
        telemetry.emit("engine", "attempt", "failed", Some("run-1"), None, Some(42), Some("tool_timeout"));

        let events = store.telemetry_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].module, "engine");
        assert_eq!(events[0].error_code.as_deref(), Some("tool_timeout"));
    }
}
