//! Policy tuner: aggregates the evaluation window into health scores,
//! classifies each (strategy, task kind) group, and converts the result into
//! bounded, reversible override proposals.
//!
//! The memory-facing rule: only the configured window feeds these
//! aggregates. Older history surfaces in evaluation reports but never in
//! runtime ranking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::TunerConfig;
use crate::errors::KernelResult;
use crate::store::{OverrideChange, StateStore};
use crate::types::{
    EvaluationRecord, OverrideScope, Recommendation, TaskKind,
};

/// Proposal plan file name (written when `apply` is off).
const PLAN_FILE: &str = "tuner_plan.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub change: OverrideChange,
    pub reason: String,
    pub priority: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub evaluations: Vec<EvaluationRecord>,
    pub proposals: Vec<Proposal>,
    /// Snapshot id when the proposals were applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_snapshot: Option<String>,
}

pub struct Tuner {
    config: TunerConfig,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for Tuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuner").finish()
    }
}

impl Tuner {
    pub fn new(config: TunerConfig, store: Arc<StateStore>) -> Self {
        Self { config, store }
    }

    /// One tuner pass. With `apply` the proposal set lands as a reversible
    /// override snapshot; otherwise it is written to a plan file for human
    /// approval. Feedback consumed by this pass is marked processed.
    pub fn run(&self, apply: bool, approved_by: &str) -> KernelResult<TunerReport> {
        let window_end = Utc::now();
        let window_start = window_end - chrono::Duration::days(self.config.window_days);

        let feedback_bias = self.feedback_bias()?;
        let mut evaluations = Vec::new();
        for (strategy_id, kind) in self.store.index().active_groups(window_start)? {
            let stats = self.store.index().window_stats(
                &strategy_id,
                Some(kind),
                window_start,
                &self.config.p1_error_kinds,
            )?;

            let latency_score = 1.0 / (1.0 + stats.p95_latency_ms as f64 / 10_000.0);
            let mut health = self.config.success_weight * stats.success_rate()
                + self.config.latency_weight * latency_score
                + self.config.fallback_weight * (1.0 - stats.fallback_rate());
            if let Some(bias) = feedback_bias.get(&(strategy_id.clone(), kind)) {
                health = (health + 0.1 * bias).clamp(0.0, 1.0);
            }

            let breached = stats.p1_breaches > 0;
            let recommendation = if breached {
                Recommendation::Demote
            } else if stats.attempts < self.config.min_samples {
                Recommendation::CollectMoreData
            } else if health >= self.config.high_watermark {
                Recommendation::Promote
            } else if health <= self.config.low_watermark {
                if self.low_streak(&strategy_id, kind)? + 1
                    >= self.config.demote_consecutive_windows
                {
                    Recommendation::Demote
                } else {
                    Recommendation::CollectMoreData
                }
            } else {
                Recommendation::CollectMoreData
            };

            let record = EvaluationRecord {
                strategy_id: strategy_id.clone(),
                task_kind: Some(kind),
                window_start,
                window_end,
                success_rate: stats.success_rate(),
                p95_latency_ms: stats.p95_latency_ms,
                fallback_rate: stats.fallback_rate(),
                health_score: health,
                samples: stats.attempts,
                recommendation,
            };
            self.store.record_evaluation(&record)?;
            evaluations.push(record);
        }

        let proposals = self.build_proposals(&evaluations)?;

        let applied_snapshot = if apply && !proposals.is_empty() {
            let changes: Vec<OverrideChange> =
                proposals.iter().map(|p| p.change.clone()).collect();
            let snapshot = self.store.snapshots().apply(&changes, approved_by)?;
            info!(snapshot = %snapshot.snapshot_id, actions = proposals.len(), "tuner overrides applied");
            Some(snapshot.snapshot_id)
        } else {
            None
        };

        let report = TunerReport {
            window_start,
            window_end,
            evaluations,
            proposals,
            applied_snapshot,
        };
        if report.applied_snapshot.is_none() {
            self.store.save_state_file(PLAN_FILE, &report)?;
        }
        self.store.mark_feedback_processed(window_end)?;
        Ok(report)
    }

    /// Net operator sentiment per (strategy, kind) for runs in the window.
    fn feedback_bias(&self) -> KernelResult<HashMap<(String, TaskKind), f64>> {
        let mut tallies: HashMap<(String, TaskKind), (f64, f64)> = HashMap::new();
        for record in self.store.feedback_records()? {
            let Some(row) = self.store.index().run(&record.run_id)? else {
                continue;
            };
            let Some(strategy) = row.chosen_strategy else {
                continue;
            };
            let entry = tallies.entry((strategy, row.task_kind)).or_default();
            if record.rating > 0 {
                entry.0 += 1.0;
            } else {
                entry.1 += 1.0;
            }
        }
        Ok(tallies
            .into_iter()
            .map(|(key, (pos, neg))| {
                let total = pos + neg;
                (key, if total == 0.0 { 0.0 } else { (pos - neg) / total })
            })
            .collect())
    }

    /// Consecutive most-recent prior evaluations at or under the low
    /// watermark for this group.
    fn low_streak(&self, strategy_id: &str, kind: TaskKind) -> KernelResult<u32> {
        let mut streak = 0u32;
        let history = self.store.evaluations()?;
        for record in history.iter().rev() {
            if record.strategy_id != strategy_id || record.task_kind != Some(kind) {
                continue;
            }
            if record.health_score <= self.config.low_watermark {
                streak += 1;
            } else {
                break;
            }
        }
        Ok(streak)
    }

    fn build_proposals(&self, evaluations: &[EvaluationRecord]) -> KernelResult<Vec<Proposal>> {
        let active = self.store.snapshots().active_set()?;
        let is_demoted = |strategy_id: &str| {
            active.iter().any(|o| {
                o.scope == OverrideScope::Strategy
                    && o.key == format!("{}.execution_mode", strategy_id)
                    && o.value == serde_json::json!("advisor")
            })
        };

        let mut proposals = Vec::new();
        for record in evaluations {
            match record.recommendation {
                Recommendation::Demote => {
                    if is_demoted(&record.strategy_id) {
                        continue;
                    }
                    let breached = record.health_score <= self.config.low_watermark;
                    let priority = if breached {
                        (self.config.low_watermark - record.health_score).max(0.0) + 0.2
                    } else {
                        // Forced by a P1/P2 pattern regardless of score.
                        1.0
                    };
                    proposals.push(Proposal {
                        change: OverrideChange {
                            scope: OverrideScope::Strategy,
                            key: format!("{}.execution_mode", record.strategy_id),
                            value: serde_json::json!("advisor"),
                        },
                        reason: format!(
                            "demote '{}' for {} tasks: health {:.2} over {} samples",
                            record.strategy_id,
                            record.task_kind.map(|k| k.as_str()).unwrap_or("all"),
                            record.health_score,
                            record.samples
                        ),
                        priority,
                    });
                }
                Recommendation::Promote => {
                    if !is_demoted(&record.strategy_id) {
                        continue;
                    }
                    proposals.push(Proposal {
                        change: OverrideChange {
                            scope: OverrideScope::Strategy,
                            key: format!("{}.execution_mode", record.strategy_id),
                            value: serde_json::Value::Null,
                        },
                        reason: format!(
                            "lift demotion of '{}': health {:.2} over {} samples",
                            record.strategy_id, record.health_score, record.samples
                        ),
                        priority: (record.health_score - self.config.high_watermark).max(0.0),
                    });
                }
                Recommendation::CollectMoreData => {}
            }
        }

        proposals.retain(|p| p.priority >= self.config.min_priority_score);
        proposals.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        proposals.truncate(self.config.max_actions);
        Ok(proposals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::types::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn store() -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        (dir, store)
    }

    fn record_attempts(
        store: &StateStore,
        strategy: &str,
        kind: TaskKind,
        succeeded: usize,
        failed: usize,
        error_kind: ErrorKind,
    ) {
        for i in 0..(succeeded + failed) {
            let ok = i < succeeded;
            let attempt = ExecutionAttempt {
                attempt_id: format!("att-{}", Uuid::new_v4()),
                run_id: format!("run-{}", i),
                strategy_id: strategy.into(),
                position: 0,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                status: if ok {
                    AttemptStatus::Succeeded
                } else {
                    AttemptStatus::Failed
                },
                error_kind: (!ok).then_some(error_kind),
                error_message: None,
                artifacts: vec![],
                advisory: false,
                telemetry: AttemptTelemetry {
                    latency_ms: 100,
                    retries: 0,
                    fallbacks_used: 0,
                },
                reflection: Reflection::default(),
            };
            store.record_attempt(&attempt, kind).unwrap();
        }
    }

    fn tuner_config() -> TunerConfig {
        // Health == success rate, so thresholds in these tests are exact.
        TunerConfig {
            demote_consecutive_windows: 3,
            success_weight: 1.0,
            latency_weight: 0.0,
            fallback_weight: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn healthy_strategy_is_not_demoted() {
        let (_dir, store) = store();
        record_attempts(&store, "web.search", TaskKind::Research, 9, 1, ErrorKind::ToolTimeout);

        let tuner = Tuner::new(tuner_config(), Arc::clone(&store));
        let report = tuner.run(false, "tuner").unwrap();
        assert_eq!(report.evaluations.len(), 1);
        assert!(report
            .proposals
            .iter()
            .all(|p| p.change.value != serde_json::json!("advisor")));
    }

    #[test]
    fn demotion_requires_consecutive_low_windows() {
        let (_dir, store) = store();
        record_attempts(&store, "web.fetch", TaskKind::Research, 0, 10, ErrorKind::ToolTimeout);
        let tuner = Tuner::new(tuner_config(), Arc::clone(&store));

        // First two windows: below watermark but streak not yet at M.
        let r1 = tuner.run(false, "tuner").unwrap();
        assert_eq!(r1.evaluations[0].recommendation, Recommendation::CollectMoreData);
        let r2 = tuner.run(false, "tuner").unwrap();
        assert_eq!(r2.evaluations[0].recommendation, Recommendation::CollectMoreData);

        // Third window crosses M=3 and proposes the demotion.
        let r3 = tuner.run(true, "tuner").unwrap();
        assert_eq!(r3.evaluations[0].recommendation, Recommendation::Demote);
        assert!(r3.applied_snapshot.is_some());

        let active = store.snapshots().active_set().unwrap();
        assert!(active
            .iter()
            .any(|o| o.key == "web.fetch.execution_mode" && o.value == serde_json::json!("advisor")));
    }

    #[test]
    fn p1_breach_forces_demotion_regardless_of_score() {
        let (_dir, store) = store();
        // Mostly successful, but one policy violation in the window.
        record_attempts(&store, "publish.site", TaskKind::Automation, 9, 1, ErrorKind::PolicyViolation);

        let tuner = Tuner::new(tuner_config(), Arc::clone(&store));
        let report = tuner.run(false, "tuner").unwrap();
        assert_eq!(report.evaluations[0].recommendation, Recommendation::Demote);
        assert!(report
            .proposals
            .iter()
            .any(|p| p.change.key == "publish.site.execution_mode"));
    }

    #[test]
    fn promotion_lifts_an_existing_demotion() {
        let (_dir, store) = store();
        store
            .snapshots()
            .apply(
                &[OverrideChange {
                    scope: OverrideScope::Strategy,
                    key: "web.search.execution_mode".into(),
                    value: serde_json::json!("advisor"),
                }],
                "tuner",
            )
            .unwrap();
        record_attempts(&store, "web.search", TaskKind::Research, 10, 0, ErrorKind::ToolTimeout);

        let tuner = Tuner::new(tuner_config(), Arc::clone(&store));
        let report = tuner.run(true, "tuner").unwrap();
        assert_eq!(report.evaluations[0].recommendation, Recommendation::Promote);

        let active = store.snapshots().active_set().unwrap();
        assert!(active.is_empty());
    }
}
