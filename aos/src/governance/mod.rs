//! Governance kernel: layered risk and approval discipline.
//!
//! Gates run twice per candidate: once when the plan is built and again
//! immediately before invocation, because policy may have changed in
//! between. All rules are declarative and config-driven; the kernel holds no
//! mutable policy state of its own.

pub mod approval;

pub use approval::{ApprovalFile, ApprovalVerifier};

use indexmap::IndexMap;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::config::GovernanceConfig;
use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::registry::{
    bind_params, ExecutionMode, ServiceDescriptor, ServiceInvocation, ServiceOutput,
    ServiceRegistry,
};
use crate::store::StateStore;
use crate::types::{Profile, RunContext, RunId, StrategyCandidate, TraceId};

pub struct GovernanceKernel {
    config: GovernanceConfig,
    sensitive: Vec<Regex>,
    verifier: ApprovalVerifier,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for GovernanceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceKernel")
            .field("sensitive_patterns", &self.sensitive.len())
            .finish()
    }
}

impl GovernanceKernel {
    pub fn new(config: GovernanceConfig, store: Arc<StateStore>) -> KernelResult<Self> {
        let sensitive = config
            .sensitive_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KernelError::Config(format!("sensitive pattern: {}", e)))?;
        let verifier = ApprovalVerifier::new(
            store.root().join(&config.approval_file),
            config.approval_secret.clone(),
        );
        Ok(Self {
            config,
            sensitive,
            verifier,
            store,
        })
    }

    pub fn approval_verifier(&self) -> &ApprovalVerifier {
        &self.verifier
    }

    /// Layer / maturity / risk / allow- and block-list gate for one
    /// candidate. Failures are `governance_block` (skip, not error).
    pub fn gate_candidate(
        &self,
        candidate: &StrategyCandidate,
        ctx: &RunContext,
    ) -> KernelResult<()> {
        if !ctx.allowed_layers.is_empty()
            && !ctx.allowed_layers.contains(&candidate.required_layer)
        {
            return Err(KernelError::attempt(
                ErrorKind::GovernanceBlock,
                format!(
                    "layer '{}' is not allowed for profile {}",
                    candidate.required_layer,
                    ctx.profile.as_str()
                ),
            ));
        }
        if ctx.blocked_maturity.contains(&candidate.maturity) {
            return Err(KernelError::attempt(
                ErrorKind::GovernanceBlock,
                format!("maturity '{}' is blocked", candidate.maturity.as_str()),
            ));
        }
        if candidate.risk_level > ctx.max_risk_level {
            return Err(KernelError::attempt(
                ErrorKind::GovernanceBlock,
                format!(
                    "risk '{}' exceeds profile cap '{}'",
                    candidate.risk_level.as_str(),
                    ctx.max_risk_level.as_str()
                ),
            ));
        }

        let profile_name = match ctx.profile {
            Profile::Strict => "strict",
            _ => "adaptive",
        };
        if let Some(preset) = self.config.profiles.get(profile_name) {
            if preset
                .blocked_strategies
                .iter()
                .any(|s| s == &candidate.strategy_id)
            {
                return Err(KernelError::attempt(
                    ErrorKind::GovernanceBlock,
                    format!("strategy '{}' is blocked", candidate.strategy_id),
                ));
            }
            if !preset.allowed_strategies.is_empty()
                && !preset
                    .allowed_strategies
                    .iter()
                    .any(|s| s == &candidate.strategy_id)
            {
                return Err(KernelError::attempt(
                    ErrorKind::GovernanceBlock,
                    format!(
                        "strategy '{}' is outside the profile allow-list",
                        candidate.strategy_id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Scan outgoing parameters for configured sensitive patterns. A match
    /// aborts the whole run with `policy_violation`.
    pub fn scan_params(
        &self,
        params: &IndexMap<String, serde_json::Value>,
    ) -> KernelResult<()> {
        for (name, value) in params {
            let text = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            for pattern in &self.sensitive {
                if pattern.is_match(&text) {
                    debug!(param = %name, "sensitive pattern matched");
                    return Err(KernelError::attempt(
                        ErrorKind::PolicyViolation,
                        format!("outgoing parameter '{}' matches a sensitive pattern", name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The governed invocation sequence: resolve, bind, safety-scan, then
    /// hand off to the registry wrapper, which evaluates the decision gates
    /// once and calls back here for the approval check before the handler
    /// runs. Engine attempts, pipeline steps and `services call` all go
    /// through this single path; updating the sequence here updates them
    /// all.
    pub async fn governed_call(
        &self,
        registry: &ServiceRegistry,
        service: &str,
        params: &IndexMap<String, serde_json::Value>,
        run_id: RunId,
        trace_id: TraceId,
        dry_run: bool,
    ) -> KernelResult<ServiceOutput> {
        let descriptor = registry
            .service(service)?
            .ok_or_else(|| KernelError::UnknownService(service.to_string()))?;

        let bound = bind_params(&descriptor.contract, params)?;
        self.scan_params(&bound)?;

        registry
            .call_with_gate(
                ServiceInvocation {
                    service: descriptor.name.clone(),
                    params: bound,
                    run_id,
                    trace_id,
                    dry_run,
                },
                |descriptor, escalated| self.check_approval(descriptor, escalated),
            )
            .await
    }

    /// Approval gate for operator-mode services. `escalated` marks a matched
    /// escalate decision gate, which routes through the same approval file.
    pub fn check_approval(
        &self,
        descriptor: &ServiceDescriptor,
        escalated: bool,
    ) -> KernelResult<()> {
        let publishes = descriptor
            .contract
            .side_effects
            .iter()
            .any(|s| s == "publish");
        let needs_approval = escalated
            || (self.config.require_approval_for_publish
                && descriptor.contract.execution_mode == ExecutionMode::Operator
                && publishes);

        if !needs_approval {
            return Ok(());
        }
        self.verifier
            .verify_and_consume(&self.store, &descriptor.name)
            .map(|approver| {
                debug!(service = %descriptor.name, %approver, "publish approved");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileGovernance;
    use crate::registry::{Acceptance, CapabilityContract};
    use crate::types::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn kernel_with(config: GovernanceConfig) -> (tempfile::TempDir, GovernanceKernel) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        let kernel = GovernanceKernel::new(config, store).unwrap();
        (dir, kernel)
    }

    fn candidate(risk: RiskLevel, maturity: Maturity, layer: &str) -> StrategyCandidate {
        StrategyCandidate {
            strategy_id: "web.fetch".into(),
            service_binding: ServiceBinding {
                service: "mcp.web.fetch".into(),
                version: "1.0.0".into(),
            },
            base_score: 0.5,
            memory_score: 0.5,
            composite_score: 0.5,
            risk_level: risk,
            maturity,
            required_layer: layer.into(),
            required_inputs: vec![],
            demoted: false,
        }
    }

    fn ctx(profile: Profile) -> RunContext {
        let mut allowed = BTreeSet::new();
        allowed.insert("capability".to_string());
        allowed.insert("connector".to_string());
        let mut blocked = BTreeSet::new();
        if profile == Profile::Strict {
            blocked.insert(Maturity::Experimental);
        }
        RunContext {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            profile,
            allowed_layers: allowed,
            blocked_maturity: blocked,
            max_risk_level: if profile == Profile::Strict {
                RiskLevel::Low
            } else {
                RiskLevel::Medium
            },
            deterministic: false,
            learning_enabled: true,
            max_fallback_steps: 3,
            trace_id: "trace-1".into(),
        }
    }

    #[test]
    fn strict_context_blocks_experimental_and_high_risk() {
        let (_dir, kernel) = kernel_with(GovernanceConfig::default());
        let ctx = ctx(Profile::Strict);

        let err = kernel
            .gate_candidate(
                &candidate(RiskLevel::Low, Maturity::Experimental, "connector"),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::GovernanceBlock));

        let err = kernel
            .gate_candidate(&candidate(RiskLevel::High, Maturity::Stable, "connector"), &ctx)
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::GovernanceBlock));

        kernel
            .gate_candidate(&candidate(RiskLevel::Low, Maturity::Stable, "connector"), &ctx)
            .unwrap();
    }

    #[test]
    fn blocked_strategy_list_applies() {
        let mut config = GovernanceConfig::default();
        let mut preset = ProfileGovernance::builtin("adaptive");
        preset.blocked_strategies = vec!["web.fetch".into()];
        config.profiles.insert("adaptive".into(), preset);
        let (_dir, kernel) = kernel_with(config);

        let err = kernel
            .gate_candidate(
                &candidate(RiskLevel::Low, Maturity::Stable, "connector"),
                &ctx(Profile::Adaptive),
            )
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::GovernanceBlock));
    }

    #[test]
    fn sensitive_params_abort_with_policy_violation() {
        let (_dir, kernel) = kernel_with(GovernanceConfig::default());
        let mut params = IndexMap::new();
        params.insert("note".to_string(), json!("api_key = sk-12345"));
        let err = kernel.scan_params(&params).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::PolicyViolation));

        let mut clean = IndexMap::new();
        clean.insert("note".to_string(), json!("quarterly numbers"));
        kernel.scan_params(&clean).unwrap();
    }

    #[tokio::test]
    async fn governed_call_gates_then_approves_then_invokes() {
        let mut config = GovernanceConfig::default();
        config.approval_secret = Some("s3cret".into());
        let (_dir, kernel) = kernel_with(config);

        let registry = ServiceRegistry::new(false);
        registry
            .register_service(
                ServiceDescriptor {
                    name: "publish.page".into(),
                    version: "0.1.0".into(),
                    description: "publish a page".into(),
                    layer: "capability".into(),
                    maturity: Maturity::Stable,
                    risk_level: RiskLevel::Medium,
                    contract: CapabilityContract {
                        inputs: vec![ParamSpec::required("text")],
                        decision_gates: vec![],
                        execution_mode: ExecutionMode::Operator,
                        fallback: None,
                        outputs: vec![],
                        acceptance: vec![Acceptance::ValueNonNull],
                        side_effects: vec!["publish".into()],
                    },
                    lint_problems: vec![],
                },
                std::sync::Arc::new(|_| {
                    Box::pin(async {
                        Ok(crate::registry::ServiceOutput {
                            value: json!({"published": true}),
                            ..Default::default()
                        })
                    })
                }),
            )
            .unwrap();

        let mut params = IndexMap::new();
        params.insert("text".to_string(), json!("release notes"));

        // No approval file: skipped with approval_required.
        let err = kernel
            .governed_call(&registry, "publish.page", &params, "run-1".into(), "t".into(), false)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ApprovalRequired));

        // Dry run exercises gates and binding without consuming approval.
        let output = kernel
            .governed_call(&registry, "publish.page", &params, "run-1".into(), "t".into(), true)
            .await
            .unwrap();
        assert!(output.advisory);

        // A sensitive parameter aborts before the registry is reached.
        let mut leaky = IndexMap::new();
        leaky.insert("text".to_string(), json!("password: hunter2"));
        let err = kernel
            .governed_call(&registry, "publish.page", &leaky, "run-1".into(), "t".into(), false)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::PolicyViolation));
    }

    #[test]
    fn publish_without_approval_is_skipped() {
        let mut config = GovernanceConfig::default();
        config.approval_secret = Some("s3cret".into());
        let (_dir, kernel) = kernel_with(config);

        let descriptor = ServiceDescriptor {
            name: "publish.site".into(),
            version: "1.0.0".into(),
            description: "publish".into(),
            layer: "capability".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Medium,
            contract: CapabilityContract {
                inputs: vec![],
                decision_gates: vec![],
                execution_mode: ExecutionMode::Operator,
                fallback: None,
                outputs: vec![],
                acceptance: vec![Acceptance::ValueNonNull],
                side_effects: vec!["publish".into()],
            },
            lint_problems: vec![],
        };

        let err = kernel.check_approval(&descriptor, false).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ApprovalRequired));

        // Advisor services never hit the approval path.
        let mut advisor = descriptor.clone();
        advisor.contract.execution_mode = ExecutionMode::Advisor;
        advisor.contract.side_effects.clear();
        kernel.check_approval(&advisor, false).unwrap();
    }
}
