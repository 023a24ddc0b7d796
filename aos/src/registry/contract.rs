//! Capability contract: the declaration every registered service must carry.
//!
//! Contracts are data. Gates are pure predicates over the bound inputs, and
//! acceptance criteria are machine-checkable post-conditions over the service
//! output; both are evaluated by the registry wrapper, never by the service
//! itself.

use serde::{Deserialize, Serialize};

use crate::types::{ArtifactKind, ParamSpec};

/// Whether a service may mutate external state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Read-only, no side effects.
    Advisor,
    /// May mutate external state; subject to approval gating.
    Operator,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Advisor => "advisor",
            ExecutionMode::Operator => "operator",
        }
    }
}

/// Pure predicate over bound input parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateCondition {
    ParamPresent { param: String },
    ParamAbsent { param: String },
    ParamEquals { param: String, value: serde_json::Value },
    /// Regex over the string form of the parameter.
    ParamMatches { param: String, pattern: String },
}

impl GateCondition {
    pub fn evaluate(&self, params: &indexmap::IndexMap<String, serde_json::Value>) -> bool {
        match self {
            GateCondition::ParamPresent { param } => params.contains_key(param),
            GateCondition::ParamAbsent { param } => !params.contains_key(param),
            GateCondition::ParamEquals { param, value } => {
                params.get(param).map(|v| v == value).unwrap_or(false)
            }
            GateCondition::ParamMatches { param, pattern } => match params.get(param) {
                Some(v) => {
                    let text = match v.as_str() {
                        Some(s) => s.to_string(),
                        None => v.to_string(),
                    };
                    regex::Regex::new(pattern)
                        .map(|re| re.is_match(&text))
                        .unwrap_or(false)
                }
                None => false,
            },
        }
    }

    fn referenced_param(&self) -> &str {
        match self {
            GateCondition::ParamPresent { param }
            | GateCondition::ParamAbsent { param }
            | GateCondition::ParamEquals { param, .. }
            | GateCondition::ParamMatches { param, .. } => param,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateAction {
    /// The service only runs when at least one trigger gate matches.
    Trigger,
    /// A matching reject gate makes the attempt ineligible.
    Reject { reason: String },
    /// A matching escalate gate routes the call through approval.
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionGate {
    pub name: String,
    pub condition: GateCondition,
    pub action: GateAction,
}

/// Machine-checkable post-condition over a service output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Acceptance {
    /// At least one artifact, optionally of a specific kind.
    ArtifactProduced {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ArtifactKind>,
    },
    ArtifactCountAtLeast { count: usize },
    /// The result value is not null.
    ValueNonNull,
    /// The result value is an object carrying this field.
    ValueHasField { field: String },
}

/// The full capability contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityContract {
    pub inputs: Vec<ParamSpec>,
    #[serde(default)]
    pub decision_gates: Vec<DecisionGate>,
    pub execution_mode: ExecutionMode,
    /// Next-best service when this one fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// Declared artifact kinds this service produces.
    #[serde(default)]
    pub outputs: Vec<ArtifactKind>,
    /// At least one is required by lint.
    pub acceptance: Vec<Acceptance>,
    /// Declared side effects, e.g. `"publish"`, for governance gating.
    #[serde(default)]
    pub side_effects: Vec<String>,
}

impl CapabilityContract {
    /// Registration-time lint. Returns the list of problems; empty is clean.
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.acceptance.is_empty() {
            problems.push("contract declares no acceptance post-condition".to_string());
        }
        let artifact_acceptance = self.acceptance.iter().any(|a| {
            matches!(
                a,
                Acceptance::ArtifactProduced { .. } | Acceptance::ArtifactCountAtLeast { .. }
            )
        });
        if artifact_acceptance && self.outputs.is_empty() {
            problems.push(
                "artifact acceptance declared but contract lists no output kinds".to_string(),
            );
        }
        for gate in &self.decision_gates {
            let param = gate.condition.referenced_param();
            if !self.inputs.iter().any(|p| p.name == param) {
                problems.push(format!(
                    "gate '{}' references undeclared input '{}'",
                    gate.name, param
                ));
            }
            if let GateCondition::ParamMatches { pattern, .. } = &gate.condition {
                if regex::Regex::new(pattern).is_err() {
                    problems.push(format!("gate '{}' has an invalid pattern", gate.name));
                }
            }
        }
        for input in &self.inputs {
            if input.required && input.high_value && input.question.is_none() {
                problems.push(format!(
                    "high-value input '{}' declares no clarification question",
                    input.name
                ));
            }
            if let Some(domain) = &input.value_domain {
                if domain.is_empty() {
                    problems.push(format!("input '{}' has an empty value domain", input.name));
                }
            }
        }
        if self.side_effects.iter().any(|s| s == "publish")
            && self.execution_mode == ExecutionMode::Advisor
        {
            problems.push("advisor services cannot declare the 'publish' side effect".to_string());
        }

        problems
    }

    /// Evaluate the decision gates against bound params.
    ///
    /// Returns `Ok(escalate)` when the service is eligible (`escalate` set if
    /// an escalate gate matched), or `Err(reason)` when it is not.
    pub fn evaluate_gates(
        &self,
        params: &indexmap::IndexMap<String, serde_json::Value>,
    ) -> Result<bool, String> {
        let mut has_trigger = false;
        let mut trigger_matched = false;
        let mut escalate = false;

        for gate in &self.decision_gates {
            let matched = gate.condition.evaluate(params);
            match &gate.action {
                GateAction::Trigger => {
                    has_trigger = true;
                    trigger_matched = trigger_matched || matched;
                }
                GateAction::Reject { reason } => {
                    if matched {
                        return Err(format!("gate '{}' rejected: {}", gate.name, reason));
                    }
                }
                GateAction::Escalate => {
                    escalate = escalate || matched;
                }
            }
        }

        if has_trigger && !trigger_matched {
            return Err("no trigger gate matched the bound inputs".to_string());
        }
        Ok(escalate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> IndexMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn contract() -> CapabilityContract {
        CapabilityContract {
            inputs: vec![
                ParamSpec::required("target"),
                ParamSpec::optional("mode").with_default(json!("fast")),
            ],
            decision_gates: vec![
                DecisionGate {
                    name: "has-target".into(),
                    condition: GateCondition::ParamPresent {
                        param: "target".into(),
                    },
                    action: GateAction::Trigger,
                },
                DecisionGate {
                    name: "no-destructive-mode".into(),
                    condition: GateCondition::ParamEquals {
                        param: "mode".into(),
                        value: json!("destructive"),
                    },
                    action: GateAction::Reject {
                        reason: "destructive mode is not supported".into(),
                    },
                },
            ],
            execution_mode: ExecutionMode::Advisor,
            fallback: None,
            outputs: vec![ArtifactKind::Md],
            acceptance: vec![Acceptance::ArtifactProduced { kind: None }],
            side_effects: vec![],
        }
    }

    #[test]
    fn clean_contract_lints_empty() {
        assert!(contract().lint().is_empty());
    }

    #[test]
    fn lint_flags_missing_acceptance_and_unknown_gate_param() {
        let mut c = contract();
        c.acceptance.clear();
        c.decision_gates.push(DecisionGate {
            name: "ghost".into(),
            condition: GateCondition::ParamPresent {
                param: "nope".into(),
            },
            action: GateAction::Trigger,
        });
        let problems = c.lint();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn reject_gate_wins_over_trigger() {
        let c = contract();
        let ok = c.evaluate_gates(&params(&[("target", json!("x"))]));
        assert_eq!(ok, Ok(false));

        let rejected = c.evaluate_gates(&params(&[
            ("target", json!("x")),
            ("mode", json!("destructive")),
        ]));
        assert!(rejected.is_err());
    }

    #[test]
    fn unmatched_trigger_makes_service_ineligible() {
        let c = contract();
        assert!(c.evaluate_gates(&params(&[("mode", json!("fast"))])).is_err());
    }

    #[test]
    fn escalate_gate_is_reported() {
        let mut c = contract();
        c.decision_gates.push(DecisionGate {
            name: "big-target".into(),
            condition: GateCondition::ParamMatches {
                param: "target".into(),
                pattern: "^prod-".into(),
            },
            action: GateAction::Escalate,
        });
        let escalate = c
            .evaluate_gates(&params(&[("target", json!("prod-site"))]))
            .unwrap();
        assert!(escalate);
    }
}
