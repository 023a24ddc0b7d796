//! Smart routing over the tool catalog.
//!
//! Ranks candidates by `intent_weight * intent_match + success_weight *
//! historical_success + latency_weight * inv_latency - cost_weight * cost`,
//! filters tools whose breaker denies admission, and keeps the TopK. The
//! intent match is a deterministic keyword overlap so identical inputs rank
//! identically.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::McpConfig;
use crate::mcp::breaker::{Admission, CircuitBreakerMap};
use crate::mcp::types::ToolDescriptor;
use crate::types::ToolCallRecord;

/// Observed history for one tool id within the routing window.
#[derive(Debug, Clone, Default)]
pub struct ToolHistory {
    pub calls: u64,
    pub successes: u64,
    pub mean_latency_ms: u64,
}

impl ToolHistory {
    pub fn success_rate(&self, prior: f64) -> f64 {
        if self.calls == 0 {
            prior
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

/// Aggregate replay records into per-tool history.
pub fn history_from_records(records: &[ToolCallRecord]) -> HashMap<String, ToolHistory> {
    let mut map: HashMap<String, (u64, u64, u64)> = HashMap::new();
    for record in records {
        let entry = map
            .entry(format!("{}/{}", record.server, record.tool))
            .or_default();
        entry.0 += 1;
        if record.succeeded {
            entry.1 += 1;
        }
        entry.2 += record.latency_ms;
    }
    map.into_iter()
        .map(|(id, (calls, successes, latency_sum))| {
            (
                id,
                ToolHistory {
                    calls,
                    successes,
                    mean_latency_ms: if calls == 0 { 0 } else { latency_sum / calls },
                },
            )
        })
        .collect()
}

fn intent_match(intent: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let intent_lower = intent.to_lowercase();
    let matched = keywords
        .iter()
        .filter(|k| intent_lower.contains(&k.to_lowercase()))
        .count();
    matched as f64 / keywords.len() as f64
}

fn inv_latency(mean_latency_ms: u64) -> f64 {
    1.0 / (1.0 + mean_latency_ms as f64 / 1000.0)
}

/// Breaker-filtered, scored, TopK-truncated candidate list.
pub fn rank_tools(
    catalog: &[ToolDescriptor],
    intent: &str,
    history: &HashMap<String, ToolHistory>,
    breakers: &CircuitBreakerMap,
    config: &McpConfig,
    now: DateTime<Utc>,
) -> Vec<ToolDescriptor> {
    let mut scored: Vec<(f64, ToolDescriptor)> = catalog
        .iter()
        .filter(|tool| {
            !matches!(
                breakers.peek_admission(&tool.id(), now),
                Admission::Deny { .. }
            )
        })
        .map(|tool| {
            let h = history.get(&tool.id()).cloned().unwrap_or_default();
            let score = config.intent_weight * intent_match(intent, &tool.keywords)
                + config.success_weight * h.success_rate(0.5)
                + config.latency_weight * inv_latency(h.mean_latency_ms)
                - config.cost_weight * tool.cost;
            (score, tool.clone())
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id().cmp(&b.1.id()))
    });

    scored
        .into_iter()
        .take(config.top_k.max(1))
        .map(|(_, tool)| tool)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn tool(server: &str, name: &str, keywords: &[&str], cost: f64) -> ToolDescriptor {
        ToolDescriptor {
            server: server.into(),
            tool: name.into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            cost,
            command: None,
        }
    }

    fn config() -> McpConfig {
        McpConfig::default()
    }

    #[test]
    fn keyword_overlap_drives_the_ranking() {
        let catalog = vec![
            tool("web", "fetch", &["fetch", "url", "http"], 0.1),
            tool("web", "search", &["search", "find"], 0.1),
        ];
        let breakers = CircuitBreakerMap::new(BreakerConfig::default());
        let ranked = rank_tools(
            &catalog,
            "fetch http://example.com and summarize",
            &HashMap::new(),
            &breakers,
            &config(),
            Utc::now(),
        );
        assert_eq!(ranked[0].tool, "fetch");
    }

    #[test]
    fn tripped_tools_are_excluded() {
        let catalog = vec![
            tool("web", "fetch", &["fetch"], 0.1),
            tool("web", "search", &["fetch"], 0.1),
        ];
        let breakers = CircuitBreakerMap::new(BreakerConfig::default());
        let now = Utc::now();
        for _ in 0..3 {
            breakers.record_failure("web/fetch", now);
        }
        let ranked = rank_tools(&catalog, "fetch", &HashMap::new(), &breakers, &config(), now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].tool, "search");
    }

    #[test]
    fn history_breaks_keyword_ties() {
        let catalog = vec![
            tool("web", "fetch", &["get"], 0.1),
            tool("cache", "fetch", &["get"], 0.1),
        ];
        let mut history = HashMap::new();
        history.insert(
            "cache/fetch".to_string(),
            ToolHistory {
                calls: 10,
                successes: 10,
                mean_latency_ms: 50,
            },
        );
        history.insert(
            "web/fetch".to_string(),
            ToolHistory {
                calls: 10,
                successes: 3,
                mean_latency_ms: 2000,
            },
        );
        let breakers = CircuitBreakerMap::new(BreakerConfig::default());
        let ranked = rank_tools(&catalog, "get", &history, &breakers, &config(), Utc::now());
        assert_eq!(ranked[0].server, "cache");
    }

    #[test]
    fn ranking_is_deterministic_for_equal_scores() {
        let catalog = vec![
            tool("b", "t", &["x"], 0.0),
            tool("a", "t", &["x"], 0.0),
        ];
        let breakers = CircuitBreakerMap::new(BreakerConfig::default());
        let ranked = rank_tools(&catalog, "x", &HashMap::new(), &breakers, &config(), Utc::now());
        assert_eq!(ranked[0].server, "a");
    }
}
