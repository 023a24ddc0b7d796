//! Planner: TaskSpec ingress and RunContext binding.
//!
//! Profile resolution order for `auto`: a task-kind override from the policy
//! log, then the configured default, then `adaptive`. `strict` disables
//! learning for the run and caps the fallback chain at one candidate.

use chrono::Utc;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AosConfig;
use crate::errors::KernelResult;
use crate::kernel::classifier;
use crate::store::StateStore;
use crate::types::{
    Origin, OverrideScope, Profile, RunContext, TaskKind, TaskSpec,
};

pub struct Planner {
    config: Arc<AosConfig>,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").finish()
    }
}

impl Planner {
    pub fn new(config: Arc<AosConfig>, store: Arc<StateStore>) -> Self {
        Self { config, store }
    }

    /// Ingress: classify the text and freeze the task spec.
    pub fn build_task(
        &self,
        text: &str,
        origin: Origin,
        explicit_params: IndexMap<String, serde_json::Value>,
        kind_override: Option<TaskKind>,
    ) -> TaskSpec {
        let task_kind =
            kind_override.unwrap_or_else(|| classifier::classify(text, &self.config.classifier));
        TaskSpec {
            task_id: format!("task-{}", Uuid::new_v4()),
            text: text.to_string(),
            task_kind,
            entered_at: Utc::now(),
            origin,
            explicit_params,
        }
    }

    /// Resolve `auto` to a bindable preset.
    pub fn resolve_profile(
        &self,
        requested: Option<Profile>,
        kind: TaskKind,
    ) -> KernelResult<Profile> {
        let requested = requested.unwrap_or_else(|| {
            self.config
                .kernel
                .default_profile
                .parse()
                .unwrap_or(Profile::Auto)
        });
        if requested != Profile::Auto {
            return Ok(requested);
        }

        let overrides = self.store.snapshots().active_set()?;
        let mapped = overrides.iter().find_map(|o| {
            (o.scope == OverrideScope::TaskKind
                && o.key == format!("{}.profile", kind.as_str()))
            .then(|| o.value.as_str().map(|s| s.to_string()))
            .flatten()
        });
        Ok(match mapped.as_deref() {
            Some("strict") => Profile::Strict,
            Some("adaptive") => Profile::Adaptive,
            _ => Profile::Adaptive,
        })
    }

    /// Bind the governance envelope for one run. The context is immutable
    /// from here on.
    pub fn bind_context(&self, task: &TaskSpec, profile: Profile) -> KernelResult<RunContext> {
        debug_assert!(profile != Profile::Auto, "auto must be resolved before binding");
        let preset = self.config.governance_profile(profile.as_str());

        let max_fallback_steps = match profile {
            Profile::Strict => 1,
            _ => preset
                .max_fallback_steps
                .unwrap_or(self.config.kernel.max_fallback_steps)
                .max(1),
        };
        let learning_enabled = profile != Profile::Strict;

        Ok(RunContext {
            run_id: format!("run-{}", Uuid::new_v4()),
            task_id: task.task_id.clone(),
            profile,
            allowed_layers: preset.allowed_layers.iter().cloned().collect::<BTreeSet<_>>(),
            blocked_maturity: preset.blocked_maturity.iter().copied().collect(),
            max_risk_level: preset.max_risk_level,
            deterministic: self.config.kernel.deterministic,
            learning_enabled,
            max_fallback_steps,
            trace_id: format!("trace-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OverrideChange;
    use crate::types::{Maturity, RiskLevel};
    use serde_json::json;

    fn planner() -> (tempfile::TempDir, Planner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        let planner = Planner::new(Arc::new(AosConfig::default()), store);
        (dir, planner)
    }

    #[test]
    fn strict_caps_fallback_and_disables_learning() {
        let (_dir, planner) = planner();
        let task = planner.build_task("build a deck", Origin::Cli, IndexMap::new(), None);
        let ctx = planner.bind_context(&task, Profile::Strict).unwrap();
        assert_eq!(ctx.max_fallback_steps, 1);
        assert!(!ctx.learning_enabled);
        assert_eq!(ctx.max_risk_level, RiskLevel::Low);
        assert!(ctx.blocked_maturity.contains(&Maturity::Experimental));
    }

    #[test]
    fn adaptive_uses_configured_cap() {
        let (_dir, planner) = planner();
        let task = planner.build_task("build a deck", Origin::Cli, IndexMap::new(), None);
        let ctx = planner.bind_context(&task, Profile::Adaptive).unwrap();
        assert_eq!(ctx.max_fallback_steps, 3);
        assert!(ctx.learning_enabled);
    }

    #[test]
    fn auto_resolves_via_task_kind_override() {
        let (_dir, planner) = planner();
        planner
            .store
            .snapshots()
            .apply(
                &[OverrideChange {
                    scope: OverrideScope::TaskKind,
                    key: "presentation.profile".into(),
                    value: json!("strict"),
                }],
                "operator",
            )
            .unwrap();

        let resolved = planner
            .resolve_profile(Some(Profile::Auto), TaskKind::Presentation)
            .unwrap();
        assert_eq!(resolved, Profile::Strict);

        // No override for research: default adaptive.
        let resolved = planner
            .resolve_profile(Some(Profile::Auto), TaskKind::Research)
            .unwrap();
        assert_eq!(resolved, Profile::Adaptive);
    }
}
