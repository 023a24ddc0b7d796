//! Configuration types for the agent kernel runtime.
//!
//! Every section is optional in the file; defaults reproduce a working local
//! setup. Validation happens in [`AosConfig::validate`] and is called on load,
//! so an invalid file is rejected before any component binds to it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::{KernelError, KernelResult};
use crate::types::{Maturity, RiskLevel};

/// Top-level runtime configuration. Maps to `aos.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AosConfig {
    /// Configuration schema version.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub slo: SloConfig,
    /// Declarative MCP tool catalog entries.
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Default for AosConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            store: StoreConfig::default(),
            kernel: KernelConfig::default(),
            classifier: ClassifierConfig::default(),
            ranker: RankerConfig::default(),
            engine: EngineConfig::default(),
            governance: GovernanceConfig::default(),
            mcp: McpConfig::default(),
            tuner: TunerConfig::default(),
            slo: SloConfig::default(),
            tools: Vec::new(),
        }
    }
}

impl AosConfig {
    /// Load from an explicit path, `$AOS_CONFIG`, or `./aos.toml`; a missing
    /// file yields the defaults. Environment overrides are applied after the
    /// file parses, then the whole config is validated.
    pub fn load(path: Option<&Path>) -> KernelResult<Self> {
        let resolved: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var("AOS_CONFIG") {
                Ok(p) => Some(PathBuf::from(p)),
                Err(_) => {
                    let default = PathBuf::from("aos.toml");
                    default.exists().then_some(default)
                }
            },
        };

        let mut config = match resolved {
            Some(p) => {
                let raw = std::fs::read_to_string(&p).map_err(|e| {
                    KernelError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                toml::from_str::<AosConfig>(&raw).map_err(|e| {
                    KernelError::Config(format!("cannot parse {}: {}", p.display(), e))
                })?
            }
            None => AosConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets and endpoints only. Risk and approval settings deliberately
    /// have no environment override path.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("AOS_STORE_ROOT") {
            self.store.root = root;
        }
        if let Ok(secret) = std::env::var("AOS_APPROVAL_SECRET") {
            self.governance.approval_secret = Some(secret);
        }
    }

    pub fn validate(&self) -> KernelResult<()> {
        let mut problems = Vec::new();

        if self.store.root.trim().is_empty() {
            problems.push("store.root must not be empty".to_string());
        }
        if self.kernel.max_fallback_steps == 0 {
            problems.push("kernel.max_fallback_steps must be >= 1".to_string());
        }
        if self.engine.queue_capacity == 0 {
            problems.push("engine.queue_capacity must be >= 1".to_string());
        }
        if self.engine.attempt_deadline_secs == 0 {
            problems.push("engine.attempt_deadline_secs must be >= 1".to_string());
        }
        for (profile, weights) in &self.ranker.weights {
            let sum = weights.base_weight + weights.memory_weight;
            if !(0.0..=2.0).contains(&sum) || weights.base_weight < 0.0 || weights.memory_weight < 0.0
            {
                problems.push(format!(
                    "ranker.weights.{}: weights must be non-negative",
                    profile
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.ranker.memory_prior) {
            problems.push("ranker.memory_prior must be in [0, 1]".to_string());
        }
        if self.mcp.retry.backoff_factor < 1.0 {
            problems.push("mcp.retry.backoff_factor must be >= 1.0".to_string());
        }
        if self.mcp.breaker.failure_threshold == 0 {
            problems.push("mcp.breaker.failure_threshold must be >= 1".to_string());
        }
        if self.tuner.low_watermark >= self.tuner.high_watermark {
            problems.push("tuner.low_watermark must be below tuner.high_watermark".to_string());
        }
        for pattern in &self.governance.sensitive_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                problems.push(format!("governance.sensitive_patterns '{}': {}", pattern, e));
            }
        }
        for (name, _) in &self.governance.profiles {
            if name != "strict" && name != "adaptive" {
                problems.push(format!(
                    "governance.profiles.{}: only 'strict' and 'adaptive' are bindable",
                    name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(KernelError::Config(problems.join("; ")))
        }
    }

    /// Governance preset for a resolved profile name, falling back to the
    /// built-in defaults for that profile.
    pub fn governance_profile(&self, profile: &str) -> ProfileGovernance {
        self.governance
            .profiles
            .get(profile)
            .cloned()
            .unwrap_or_else(|| ProfileGovernance::builtin(profile))
    }

    /// Score weights for a profile, falling back to the shared defaults.
    pub fn score_weights(&self, profile: &str) -> ScoreWeights {
        self.ranker
            .weights
            .get(profile)
            .cloned()
            .unwrap_or_else(|| ScoreWeights {
                base_weight: self.ranker.base_weight,
                memory_weight: self.ranker.memory_weight,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Root directory for event logs, artifacts, index db and snapshots.
    #[serde(default = "default_store_root")]
    pub root: String,
    /// fsync every event-log append.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

fn default_store_root() -> String {
    ".aos".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelConfig {
    /// Profile bound when the operator does not name one: strict | adaptive | auto.
    #[serde(default = "default_profile")]
    pub default_profile: String,
    /// Fallback cap for adaptive runs; strict always caps at 1.
    #[serde(default = "default_max_fallback_steps")]
    pub max_fallback_steps: usize,
    /// Deterministic runs disable retry jitter.
    #[serde(default)]
    pub deterministic: bool,
}

fn default_profile() -> String {
    "auto".to_string()
}

fn default_max_fallback_steps() -> usize {
    3
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile(),
            max_fallback_steps: default_max_fallback_steps(),
            deterministic: false,
        }
    }
}

/// Explicit-prefix rule for task classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefixRule {
    pub prefix: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Checked first, in order; `"ppt:"` style explicit verbs.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<PrefixRule>,
    /// Keyword catalog per task kind, matched case-insensitively against the text.
    #[serde(default = "default_keywords")]
    pub keywords: HashMap<String, Vec<String>>,
}

fn default_prefixes() -> Vec<PrefixRule> {
    vec![
        PrefixRule {
            prefix: "ppt:".into(),
            kind: "presentation".into(),
        },
        PrefixRule {
            prefix: "research:".into(),
            kind: "research".into(),
        },
        PrefixRule {
            prefix: "sql:".into(),
            kind: "data-query".into(),
        },
        PrefixRule {
            prefix: "auto:".into(),
            kind: "automation".into(),
        },
    ]
}

fn default_keywords() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "presentation".to_string(),
        vec![
            "slide".into(),
            "deck".into(),
            "presentation".into(),
            "框架".into(),
            "复盘".into(),
            "汇报".into(),
            "ppt".into(),
        ],
    );
    map.insert(
        "research".to_string(),
        vec![
            "research".into(),
            "summarize".into(),
            "摘要".into(),
            "调研".into(),
            "分析".into(),
            "http://".into(),
            "https://".into(),
        ],
    );
    map.insert(
        "data-query".to_string(),
        vec![
            "query".into(),
            "sql".into(),
            "数据".into(),
            "查询".into(),
            "统计".into(),
        ],
    );
    map.insert(
        "image".to_string(),
        vec!["image".into(), "diagram".into(), "图".into(), "绘制".into()],
    );
    map.insert(
        "automation".to_string(),
        vec![
            "automate".into(),
            "schedule".into(),
            "抓取".into(),
            "自动".into(),
            "定时".into(),
        ],
    );
    map
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            keywords: default_keywords(),
        }
    }
}

/// Per-profile composite score weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    pub base_weight: f64,
    pub memory_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankerConfig {
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    #[serde(default = "default_memory_weight")]
    pub memory_weight: f64,
    /// Prior success ratio when a strategy has no history in the window.
    #[serde(default = "default_memory_prior")]
    pub memory_prior: f64,
    /// Pseudo-count strength of the prior in the smoothed ratio.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
    /// Composite gap under which a strict-profile plan is flagged ambiguous.
    #[serde(default = "default_ambiguity_threshold")]
    pub ambiguity_threshold: f64,
    /// Per-profile overrides of the two weights above.
    #[serde(default)]
    pub weights: HashMap<String, ScoreWeights>,
}

fn default_base_weight() -> f64 {
    0.6
}

fn default_memory_weight() -> f64 {
    0.4
}

fn default_memory_prior() -> f64 {
    0.5
}

fn default_prior_strength() -> f64 {
    4.0
}

fn default_ambiguity_threshold() -> f64 {
    0.05
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            base_weight: default_base_weight(),
            memory_weight: default_memory_weight(),
            memory_prior: default_memory_prior(),
            prior_strength: default_prior_strength(),
            ambiguity_threshold: default_ambiguity_threshold(),
            weights: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Per-attempt deadline.
    #[serde(default = "default_attempt_deadline_secs")]
    pub attempt_deadline_secs: u64,
    /// Worker pool size; 0 means `min(4, cores)`.
    #[serde(default)]
    pub worker_pool: usize,
    /// Bounded admission queue; overflow is backpressure.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_attempt_deadline_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_deadline_secs: default_attempt_deadline_secs(),
            worker_pool: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn effective_worker_pool(&self) -> usize {
        if self.worker_pool > 0 {
            self.worker_pool
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(1)
        }
    }
}

/// Governance preset bound into a run context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileGovernance {
    #[serde(default = "default_allowed_layers")]
    pub allowed_layers: Vec<String>,
    #[serde(default)]
    pub blocked_maturity: Vec<Maturity>,
    #[serde(default = "default_max_risk")]
    pub max_risk_level: RiskLevel,
    /// Overrides the kernel-level fallback cap for this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fallback_steps: Option<usize>,
    #[serde(default)]
    pub allowed_strategies: Vec<String>,
    #[serde(default)]
    pub blocked_strategies: Vec<String>,
}

fn default_allowed_layers() -> Vec<String> {
    vec!["capability".into(), "connector".into(), "generalist".into()]
}

fn default_max_risk() -> RiskLevel {
    RiskLevel::Medium
}

impl ProfileGovernance {
    /// Built-in presets used when the config file does not name the profile.
    pub fn builtin(profile: &str) -> Self {
        match profile {
            "strict" => Self {
                allowed_layers: default_allowed_layers(),
                blocked_maturity: vec![Maturity::Experimental],
                max_risk_level: RiskLevel::Low,
                max_fallback_steps: Some(1),
                allowed_strategies: Vec::new(),
                blocked_strategies: Vec::new(),
            },
            _ => Self {
                allowed_layers: default_allowed_layers(),
                blocked_maturity: Vec::new(),
                max_risk_level: RiskLevel::Medium,
                max_fallback_steps: None,
                allowed_strategies: Vec::new(),
                blocked_strategies: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernanceConfig {
    /// Presets keyed by bindable profile name (`strict`, `adaptive`).
    #[serde(default)]
    pub profiles: HashMap<String, ProfileGovernance>,
    #[serde(default = "default_true")]
    pub require_approval_for_publish: bool,
    /// Approval file path, relative to the store root.
    #[serde(default = "default_approval_file")]
    pub approval_file: String,
    /// Shared secret for approval signatures. Env-overridable
    /// (`AOS_APPROVAL_SECRET`); the gate itself is not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_secret: Option<String>,
    /// Outgoing parameters matching any of these abort the run.
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
    /// Fail process start on any contract lint finding.
    #[serde(default)]
    pub strict_contract_lint: bool,
}

fn default_approval_file() -> String {
    "approvals/publish.json".to_string()
}

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        r"(?i)api[_-]?key\s*[=:]\s*\S+".into(),
        r"(?i)secret\s*[=:]\s*\S+".into(),
        r"(?i)password\s*[=:]\s*\S+".into(),
        r"-----BEGIN (RSA |EC )?PRIVATE KEY-----".into(),
    ]
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            require_approval_for_publish: true,
            approval_file: default_approval_file(),
            approval_secret: None,
            sensitive_patterns: default_sensitive_patterns(),
            strict_contract_lint: false,
        }
    }
}

/// Retry policy for connector calls (serializable form).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    /// Fractional jitter, e.g. 0.2 for +/-20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that trip the breaker.
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_secs: 600,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpConfig {
    /// Routing weight on intent match (alpha).
    #[serde(default = "default_intent_weight")]
    pub intent_weight: f64,
    /// Routing weight on historical success (beta).
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    /// Routing weight on inverse latency (gamma).
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    /// Routing penalty weight on cost (delta).
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Whole-chain budget across retries and fallbacks.
    #[serde(default = "default_chain_deadline_secs")]
    pub chain_deadline_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_intent_weight() -> f64 {
    0.4
}

fn default_success_weight() -> f64 {
    0.3
}

fn default_latency_weight() -> f64 {
    0.2
}

fn default_cost_weight() -> f64 {
    0.1
}

fn default_top_k() -> usize {
    3
}

fn default_chain_deadline_secs() -> u64 {
    120
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            intent_weight: default_intent_weight(),
            success_weight: default_success_weight(),
            latency_weight: default_latency_weight(),
            cost_weight: default_cost_weight(),
            top_k: default_top_k(),
            chain_deadline_secs: default_chain_deadline_secs(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Below this sample count the recommendation is collect-more-data.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    /// Consecutive below-watermark windows before a demotion fires.
    #[serde(default = "default_demote_windows")]
    pub demote_consecutive_windows: u32,
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    #[serde(default = "default_min_priority_score")]
    pub min_priority_score: f64,
    #[serde(default = "default_tuner_success_weight")]
    pub success_weight: f64,
    #[serde(default = "default_tuner_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_tuner_fallback_weight")]
    pub fallback_weight: f64,
    /// Error kinds whose presence in the window forces demotion to advisor.
    #[serde(default = "default_p1_error_kinds")]
    pub p1_error_kinds: Vec<String>,
}

fn default_window_days() -> i64 {
    7
}

fn default_min_samples() -> u64 {
    5
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_low_watermark() -> f64 {
    0.4
}

fn default_demote_windows() -> u32 {
    3
}

fn default_max_actions() -> usize {
    5
}

fn default_min_priority_score() -> f64 {
    0.1
}

fn default_tuner_success_weight() -> f64 {
    0.5
}

fn default_tuner_latency_weight() -> f64 {
    0.2
}

fn default_tuner_fallback_weight() -> f64 {
    0.3
}

fn default_p1_error_kinds() -> Vec<String> {
    vec!["policy_violation".into(), "contract_violation".into()]
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            min_samples: default_min_samples(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            demote_consecutive_windows: default_demote_windows(),
            max_actions: default_max_actions(),
            min_priority_score: default_min_priority_score(),
            success_weight: default_tuner_success_weight(),
            latency_weight: default_tuner_latency_weight(),
            fallback_weight: default_tuner_fallback_weight(),
            p1_error_kinds: default_p1_error_kinds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SloConfig {
    pub success_target: f64,
    pub p95_target_ms: u64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            success_target: 0.9,
            p95_target_ms: 60_000,
        }
    }
}

/// Declarative MCP tool catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    pub server: String,
    pub tool: String,
    /// Intent-match vocabulary for the smart router.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Relative invocation cost in `[0, 1]`.
    #[serde(default)]
    pub cost: f64,
    /// Command line for a stdio-transport tool; in-process when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_validates() {
        let config = AosConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kernel.default_profile, "auto");
        assert_eq!(config.engine.attempt_deadline_secs, 60);
        assert_eq!(config.mcp.retry.max_retries, 2);
        assert_eq!(config.mcp.breaker.failure_threshold, 3);
        assert_eq!(config.mcp.breaker.cooldown_secs, 300);
    }

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: AosConfig = toml::from_str("[store]\nroot = \"/tmp/aos\"\n").unwrap();
        assert_eq!(config.store.root, "/tmp/aos");
        assert_eq!(config.tuner.window_days, 7);
        assert!(config.governance.require_approval_for_publish);
    }

    #[test]
    fn strict_builtin_caps_fallback_and_blocks_experimental() {
        let strict = ProfileGovernance::builtin("strict");
        assert_eq!(strict.max_fallback_steps, Some(1));
        assert!(strict.blocked_maturity.contains(&Maturity::Experimental));
        assert_eq!(strict.max_risk_level, RiskLevel::Low);
    }

    #[test]
    fn invalid_watermarks_are_rejected() {
        let mut config = AosConfig::default();
        config.tuner.low_watermark = 0.9;
        config.tuner.high_watermark = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_sensitive_pattern_is_a_config_error() {
        let mut config = AosConfig::default();
        config.governance.sensitive_patterns.push("(unclosed".into());
        assert!(config.validate().is_err());
    }
}
