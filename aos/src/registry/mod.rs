//! Service registry: uniform invocation of leaf capabilities.
//!
//! A service is a [`ServiceDescriptor`] (pure data, including its
//! [`CapabilityContract`]) plus an injected handler function. Strategies are
//! registered bindings from task kinds onto services; the ranker enumerates
//! them and the engine invokes through [`ServiceRegistry::call`], which
//! wraps every invocation with gate evaluation and acceptance checking.

pub mod builtins;
pub mod contract;

pub use contract::{
    Acceptance, CapabilityContract, DecisionGate, ExecutionMode, GateAction, GateCondition,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::types::{
    ArtifactRef, Maturity, RiskLevel, RunId, StrategyId, TaskKind, TraceId,
};

/// Behavior injected into a descriptor as a function value.
pub type ServiceHandler =
    Arc<dyn Fn(ServiceInvocation) -> BoxFuture<'static, KernelResult<ServiceOutput>> + Send + Sync>;

/// Pure data record describing a registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Architectural tier used for risk zoning.
    pub layer: String,
    pub maturity: Maturity,
    pub risk_level: RiskLevel,
    pub contract: CapabilityContract,
    /// Lint findings recorded at registration; non-empty makes every call skip.
    #[serde(default)]
    pub lint_problems: Vec<String>,
}

/// Registered binding from task kinds onto a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub strategy_id: StrategyId,
    pub service: String,
    pub task_kinds: Vec<TaskKind>,
    /// Vocabulary for the deterministic base score.
    pub keywords: Vec<String>,
}

/// One call into a service.
#[derive(Debug, Clone)]
pub struct ServiceInvocation {
    pub service: String,
    pub params: IndexMap<String, serde_json::Value>,
    pub run_id: RunId,
    pub trace_id: TraceId,
    pub dry_run: bool,
}

/// What a service hands back. Artifacts are already surrendered to the
/// content-addressed store; only references travel here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOutput {
    pub value: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Marks partial, advisory-grade output.
    #[serde(default)]
    pub advisory: bool,
    /// Transient retries spent by a connector-backed handler.
    #[serde(default)]
    pub retries: u32,
    /// Tool fallbacks spent by a connector-backed handler.
    #[serde(default)]
    pub tool_fallbacks: u32,
}

struct Entry {
    descriptor: ServiceDescriptor,
    handler: ServiceHandler,
}

/// Registry of services and strategies.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Entry>>,
    strategies: RwLock<HashMap<StrategyId, StrategyDescriptor>>,
    strict_lint: bool,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.services.read().map(|s| s.len()).unwrap_or(0);
        let strategies = self.strategies.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("ServiceRegistry")
            .field("services", &services)
            .field("strategies", &strategies)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(strict_lint: bool) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            strict_lint,
        }
    }

    /// Register a service. Lint findings fail registration in strict mode;
    /// otherwise they are recorded on the descriptor and every call skips.
    pub fn register_service(
        &self,
        mut descriptor: ServiceDescriptor,
        handler: ServiceHandler,
    ) -> KernelResult<()> {
        let problems = descriptor.contract.lint();
        if !problems.is_empty() {
            if self.strict_lint {
                return Err(KernelError::ContractLint {
                    service: descriptor.name,
                    problems,
                });
            }
            warn!(service = %descriptor.name, ?problems, "contract lint findings");
            descriptor.lint_problems = problems;
        }

        let mut services = self
            .services
            .write()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        services.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_strategy(&self, strategy: StrategyDescriptor) -> KernelResult<()> {
        if self.service(&strategy.service)?.is_none() {
            return Err(KernelError::UnknownService(strategy.service));
        }
        let mut strategies = self
            .strategies
            .write()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        strategies.insert(strategy.strategy_id.clone(), strategy);
        Ok(())
    }

    pub fn service(&self, name: &str) -> KernelResult<Option<ServiceDescriptor>> {
        let services = self
            .services
            .read()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        Ok(services.get(name).map(|e| e.descriptor.clone()))
    }

    pub fn list(&self) -> KernelResult<Vec<ServiceDescriptor>> {
        let services = self
            .services
            .read()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        let mut out: Vec<_> = services.values().map(|e| e.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn strategy(&self, id: &str) -> KernelResult<Option<StrategyDescriptor>> {
        let strategies = self
            .strategies
            .read()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        Ok(strategies.get(id).cloned())
    }

    pub fn strategies(&self) -> KernelResult<Vec<StrategyDescriptor>> {
        let strategies = self
            .strategies
            .read()
            .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
        let mut out: Vec<_> = strategies.values().cloned().collect();
        out.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        Ok(out)
    }

    /// Invoke a service with gate evaluation and acceptance checking.
    ///
    /// `invocation.params` should already be bound via [`bind_params`]; the
    /// gates are evaluated here regardless so direct callers get the same
    /// eligibility discipline as the engine.
    pub async fn call(&self, invocation: ServiceInvocation) -> KernelResult<ServiceOutput> {
        self.call_with_gate(invocation, |_, _| Ok(())).await
    }

    /// Like [`Self::call`], with a hook between gate evaluation and the
    /// handler. The hook receives the resolved descriptor and whether an
    /// escalate gate matched; governance uses it for the approval check, so
    /// the gates are evaluated exactly once per invocation and this wrapper
    /// stays the single enforcement point.
    pub async fn call_with_gate<F>(
        &self,
        invocation: ServiceInvocation,
        pre_invoke: F,
    ) -> KernelResult<ServiceOutput>
    where
        F: FnOnce(&ServiceDescriptor, bool) -> KernelResult<()>,
    {
        let (descriptor, handler) = {
            let services = self
                .services
                .read()
                .map_err(|_| KernelError::Store("registry lock poisoned".into()))?;
            let entry = services
                .get(&invocation.service)
                .ok_or_else(|| KernelError::UnknownService(invocation.service.clone()))?;
            (entry.descriptor.clone(), Arc::clone(&entry.handler))
        };

        if !descriptor.lint_problems.is_empty() {
            return Err(KernelError::attempt(
                ErrorKind::GovernanceBlock,
                format!(
                    "service '{}' has unresolved contract lint findings",
                    descriptor.name
                ),
            ));
        }

        let escalated = descriptor
            .contract
            .evaluate_gates(&invocation.params)
            .map_err(|reason| KernelError::attempt(ErrorKind::GovernanceBlock, reason))?;

        if invocation.dry_run {
            // Gates and binding exercised; the handler never runs.
            return Ok(ServiceOutput {
                value: serde_json::json!({
                    "dry_run": true,
                    "service": descriptor.name,
                    "bound_params": invocation.params,
                }),
                artifacts: vec![],
                assumptions: vec!["dry-run: handler not invoked".to_string()],
                advisory: true,
                ..Default::default()
            });
        }

        // After the dry-run return, so a dry run never consumes an approval.
        pre_invoke(&descriptor, escalated)?;

        let output = handler(invocation).await?;

        if let Err(reason) = check_acceptance(&descriptor.contract, &output) {
            return Err(KernelError::attempt(ErrorKind::ContractViolation, reason));
        }
        Ok(output)
    }
}

/// Resolve a contract's inputs against provided parameters: apply defaults,
/// validate value domains, and fail with `missing_input` on absent required
/// parameters. Extra provided parameters pass through untouched.
pub fn bind_params(
    contract: &CapabilityContract,
    provided: &IndexMap<String, serde_json::Value>,
) -> KernelResult<IndexMap<String, serde_json::Value>> {
    let mut bound = provided.clone();

    for input in &contract.inputs {
        match bound.get(&input.name) {
            Some(value) => {
                if let Some(domain) = &input.value_domain {
                    let as_text = value.as_str().map(|s| s.to_string()).unwrap_or_else(|| {
                        value.to_string()
                    });
                    if !domain.iter().any(|d| d == &as_text) {
                        return Err(KernelError::attempt(
                            ErrorKind::MissingInput,
                            format!(
                                "parameter '{}' value '{}' outside domain [{}]",
                                input.name,
                                as_text,
                                domain.join(", ")
                            ),
                        ));
                    }
                }
            }
            None => {
                if let Some(default) = &input.default {
                    bound.insert(input.name.clone(), default.clone());
                } else if input.required {
                    return Err(KernelError::attempt(
                        ErrorKind::MissingInput,
                        format!("required parameter '{}' is missing", input.name),
                    ));
                }
            }
        }
    }
    Ok(bound)
}

/// Clarification questions for required high-value inputs that have neither a
/// provided value nor a default. Capped at two per run by the caller.
pub fn clarification_questions(
    contract: &CapabilityContract,
    provided: &IndexMap<String, serde_json::Value>,
) -> Vec<String> {
    contract
        .inputs
        .iter()
        .filter(|p| p.required && p.high_value && p.default.is_none())
        .filter(|p| !provided.contains_key(&p.name))
        .filter_map(|p| p.question.clone())
        .collect()
}

/// Check every acceptance post-condition against the output.
pub fn check_acceptance(
    contract: &CapabilityContract,
    output: &ServiceOutput,
) -> Result<(), String> {
    for acceptance in &contract.acceptance {
        match acceptance {
            Acceptance::ArtifactProduced { kind } => {
                let ok = match kind {
                    Some(kind) => output.artifacts.iter().any(|a| a.kind == *kind),
                    None => !output.artifacts.is_empty(),
                };
                if !ok {
                    return Err("acceptance failed: expected artifact not produced".to_string());
                }
            }
            Acceptance::ArtifactCountAtLeast { count } => {
                if output.artifacts.len() < *count {
                    return Err(format!(
                        "acceptance failed: {} artifacts produced, {} required",
                        output.artifacts.len(),
                        count
                    ));
                }
            }
            Acceptance::ValueNonNull => {
                if output.value.is_null() {
                    return Err("acceptance failed: null result value".to_string());
                }
            }
            Acceptance::ValueHasField { field } => {
                if output.value.get(field).is_none() {
                    return Err(format!(
                        "acceptance failed: result value lacks field '{}'",
                        field
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamSpec;
    use serde_json::json;

    fn descriptor(name: &str, contract: CapabilityContract) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            version: "1.0.0".into(),
            description: "test service".into(),
            layer: "capability".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            contract,
            lint_problems: vec![],
        }
    }

    fn echo_contract() -> CapabilityContract {
        CapabilityContract {
            inputs: vec![ParamSpec::required("text")],
            decision_gates: vec![],
            execution_mode: ExecutionMode::Advisor,
            fallback: None,
            outputs: vec![],
            acceptance: vec![Acceptance::ValueHasField {
                field: "echo".into(),
            }],
            side_effects: vec![],
        }
    }

    fn echo_handler() -> ServiceHandler {
        Arc::new(|invocation: ServiceInvocation| {
            Box::pin(async move {
                Ok(ServiceOutput {
                    value: json!({ "echo": invocation.params.get("text") }),
                    ..Default::default()
                })
            })
        })
    }

    fn invocation(service: &str, params: IndexMap<String, serde_json::Value>) -> ServiceInvocation {
        ServiceInvocation {
            service: service.to_string(),
            params,
            run_id: "run-1".into(),
            trace_id: "trace-1".into(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn call_runs_handler_and_checks_acceptance() {
        let registry = ServiceRegistry::new(false);
        registry
            .register_service(descriptor("echo", echo_contract()), echo_handler())
            .unwrap();

        let mut params = IndexMap::new();
        params.insert("text".to_string(), json!("hi"));
        let output = registry.call(invocation("echo", params)).await.unwrap();
        assert_eq!(output.value["echo"], json!("hi"));
    }

    #[tokio::test]
    async fn acceptance_failure_is_contract_violation() {
        let registry = ServiceRegistry::new(false);
        let mut contract = echo_contract();
        contract.acceptance = vec![Acceptance::ArtifactCountAtLeast { count: 1 }];
        contract.outputs = vec![crate::types::ArtifactKind::Md];
        registry
            .register_service(descriptor("echo", contract), echo_handler())
            .unwrap();

        let mut params = IndexMap::new();
        params.insert("text".to_string(), json!("hi"));
        let err = registry.call(invocation("echo", params)).await.unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ContractViolation));
    }

    #[tokio::test]
    async fn strict_lint_fails_registration() {
        let registry = ServiceRegistry::new(true);
        let mut contract = echo_contract();
        contract.acceptance.clear();
        let err = registry
            .register_service(descriptor("broken", contract), echo_handler())
            .unwrap_err();
        assert!(matches!(err, KernelError::ContractLint { .. }));
    }

    #[tokio::test]
    async fn lenient_lint_registers_but_calls_skip() {
        let registry = ServiceRegistry::new(false);
        let mut contract = echo_contract();
        contract.acceptance.clear();
        registry
            .register_service(descriptor("broken", contract), echo_handler())
            .unwrap();

        let err = registry
            .call(invocation("broken", IndexMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::GovernanceBlock));
    }

    #[test]
    fn bind_params_applies_defaults_and_rejects_missing() {
        let contract = CapabilityContract {
            inputs: vec![
                ParamSpec::required("target"),
                ParamSpec::optional("mode").with_default(json!("fast")),
            ],
            decision_gates: vec![],
            execution_mode: ExecutionMode::Advisor,
            fallback: None,
            outputs: vec![],
            acceptance: vec![Acceptance::ValueNonNull],
            side_effects: vec![],
        };

        let mut provided = IndexMap::new();
        provided.insert("target".to_string(), json!("x"));
        let bound = bind_params(&contract, &provided).unwrap();
        assert_eq!(bound["mode"], json!("fast"));

        let err = bind_params(&contract, &IndexMap::new()).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::MissingInput));
    }

    #[test]
    fn clarification_only_for_high_value_required_inputs() {
        let contract = CapabilityContract {
            inputs: vec![
                ParamSpec::required("dataset").high_value("Which dataset should be queried?"),
                ParamSpec::required("plain"),
                ParamSpec::optional("nice").high_value("Ignored for optional"),
            ],
            decision_gates: vec![],
            execution_mode: ExecutionMode::Advisor,
            fallback: None,
            outputs: vec![],
            acceptance: vec![Acceptance::ValueNonNull],
            side_effects: vec![],
        };
        let questions = clarification_questions(&contract, &IndexMap::new());
        assert_eq!(questions, vec!["Which dataset should be queried?".to_string()]);
    }
}
