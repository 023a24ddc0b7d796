//! Strategy ranker: candidate generation, memory-weighted scoring and the
//! deterministic ordering that turns a run context into an execution plan.
//!
//! Scoring is a pure reduction over the candidate record: `composite =
//! base_weight * base_score + memory_weight * memory_score`. The base score
//! is a keyword fit against the task text; the memory score is a smoothed
//! success ratio over the configured evaluation window, falling back to the
//! configured prior when a strategy has no history there.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::AosConfig;
use crate::errors::KernelResult;
use crate::governance::GovernanceKernel;
use crate::registry::ServiceRegistry;
use crate::store::StateStore;
use crate::types::{
    ExecutionPlan, Profile, RunContext, ServiceBinding, StrategyCandidate, TaskSpec,
};

pub struct Ranker {
    config: Arc<AosConfig>,
    registry: Arc<ServiceRegistry>,
    governance: Arc<GovernanceKernel>,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for Ranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranker").finish()
    }
}

impl Ranker {
    pub fn new(
        config: Arc<AosConfig>,
        registry: Arc<ServiceRegistry>,
        governance: Arc<GovernanceKernel>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            config,
            registry,
            governance,
            store,
        }
    }

    /// Build the ordered candidate list for one run.
    pub fn plan(&self, ctx: &RunContext, task: &TaskSpec) -> KernelResult<ExecutionPlan> {
        let weights = self.config.score_weights(ctx.profile.as_str());
        let window_start =
            Utc::now() - chrono::Duration::days(self.config.tuner.window_days);
        let overrides = self.store.snapshots().active_set()?;

        let mut candidates = Vec::new();
        for strategy in self.registry.strategies()? {
            if !strategy.task_kinds.contains(&task.task_kind) {
                continue;
            }
            let service = match self.registry.service(&strategy.service)? {
                Some(s) => s,
                None => continue,
            };

            let demoted = overrides.iter().any(|o| {
                o.scope == crate::types::OverrideScope::Strategy
                    && o.key == format!("{}.execution_mode", strategy.strategy_id)
                    && o.value == serde_json::json!("advisor")
            });

            let base_score = keyword_fit(&task.text, &strategy.keywords);
            let stats = self.store.index().window_stats(
                &strategy.strategy_id,
                Some(task.task_kind),
                window_start,
                &[],
            )?;
            let memory_score = smoothed_success(
                stats.successes,
                stats.attempts,
                self.config.ranker.memory_prior,
                self.config.ranker.prior_strength,
            );

            let mut candidate = StrategyCandidate {
                strategy_id: strategy.strategy_id.clone(),
                service_binding: ServiceBinding {
                    service: service.name.clone(),
                    version: service.version.clone(),
                },
                base_score,
                memory_score,
                composite_score: 0.0,
                risk_level: service.risk_level,
                maturity: service.maturity,
                required_layer: service.layer.clone(),
                required_inputs: service.contract.inputs.clone(),
                demoted,
            };
            candidate.composite_score =
                weights.base_weight * base_score + weights.memory_weight * memory_score;

            // Plan-time governance filter; the engine re-checks at exec time.
            if self.governance.gate_candidate(&candidate, ctx).is_err() {
                continue;
            }
            candidates.push(candidate);
        }

        candidates.sort_by(compare_candidates);

        let ambiguous = ctx.profile == Profile::Strict
            && candidates.len() >= 2
            && (candidates[0].composite_score - candidates[1].composite_score)
                < self.config.ranker.ambiguity_threshold;

        candidates.truncate(ctx.max_fallback_steps.max(1));

        Ok(ExecutionPlan {
            run_id: ctx.run_id.clone(),
            candidates,
            ambiguous,
            built_at: Utc::now(),
        })
    }
}

/// Deterministic ordering: demoted strategies last, then composite
/// descending, risk ascending, maturity descending, id lexicographic.
fn compare_candidates(a: &StrategyCandidate, b: &StrategyCandidate) -> Ordering {
    a.demoted
        .cmp(&b.demoted)
        .then_with(|| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.risk_level.cmp(&b.risk_level))
        .then_with(|| b.maturity.cmp(&a.maturity))
        .then_with(|| a.strategy_id.cmp(&b.strategy_id))
}

/// Deterministic keyword fit of the task text in `[0, 1]`.
fn keyword_fit(text: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let matched = keywords
        .iter()
        .filter(|k| lower.contains(&k.to_lowercase()))
        .count();
    matched as f64 / keywords.len() as f64
}

/// Laplace-smoothed success ratio; zero attempts yield the prior exactly.
fn smoothed_success(successes: u64, attempts: u64, prior: f64, strength: f64) -> f64 {
    (successes as f64 + prior * strength) / (attempts as f64 + strength)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Maturity, RiskLevel};

    fn candidate(id: &str, composite: f64, risk: RiskLevel, maturity: Maturity) -> StrategyCandidate {
        StrategyCandidate {
            strategy_id: id.into(),
            service_binding: ServiceBinding {
                service: format!("svc.{}", id),
                version: "1.0.0".into(),
            },
            base_score: 0.0,
            memory_score: 0.0,
            composite_score: composite,
            risk_level: risk,
            maturity,
            required_layer: "capability".into(),
            required_inputs: vec![],
            demoted: false,
        }
    }

    #[test]
    fn ordering_follows_the_four_tie_break_keys() {
        let mut list = vec![
            candidate("delta", 0.5, RiskLevel::Low, Maturity::Stable),
            candidate("alpha", 0.5, RiskLevel::Low, Maturity::Stable),
            candidate("beta", 0.5, RiskLevel::Medium, Maturity::Stable),
            candidate("gamma", 0.5, RiskLevel::Low, Maturity::Beta),
            candidate("omega", 0.9, RiskLevel::High, Maturity::Experimental),
        ];
        list.sort_by(compare_candidates);
        let ids: Vec<&str> = list.iter().map(|c| c.strategy_id.as_str()).collect();
        // Composite first, then low risk, then stable, then lexicographic.
        assert_eq!(ids, vec!["omega", "alpha", "delta", "gamma", "beta"]);
    }

    #[test]
    fn demoted_candidates_sort_after_everything() {
        let mut demoted = candidate("best", 0.9, RiskLevel::Low, Maturity::Stable);
        demoted.demoted = true;
        let mut list = vec![demoted, candidate("ok", 0.2, RiskLevel::Low, Maturity::Stable)];
        list.sort_by(compare_candidates);
        assert_eq!(list[0].strategy_id, "ok");
        assert_eq!(list[1].strategy_id, "best");
    }

    #[test]
    fn keyword_fit_is_case_insensitive_and_bounded() {
        let keywords = vec!["deck".to_string(), "复盘".to_string()];
        assert_eq!(keyword_fit("请生成复盘 Deck", &keywords), 1.0);
        assert_eq!(keyword_fit("unrelated", &keywords), 0.0);
        assert_eq!(keyword_fit("anything", &[]), 0.0);
    }

    #[test]
    fn missing_history_yields_the_prior() {
        assert_eq!(smoothed_success(0, 0, 0.5, 4.0), 0.5);
        // History pulls the ratio toward the observed rate.
        let with_history = smoothed_success(9, 10, 0.5, 4.0);
        assert!(with_history > 0.5 && with_history < 0.9);
    }
}
