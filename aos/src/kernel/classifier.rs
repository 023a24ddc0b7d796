//! Rule-based task classification.
//!
//! Three stages, first hit wins: explicit configured prefixes, keyword and
//! context match against the capability catalog vocabulary, then `other`.
//! An unknown kind is not an error; it routes to the generalist strategies.

use crate::config::ClassifierConfig;
use crate::types::TaskKind;

pub fn classify(text: &str, config: &ClassifierConfig) -> TaskKind {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();

    for rule in &config.prefixes {
        if lower.starts_with(&rule.prefix.to_lowercase()) {
            return TaskKind::from_str_loose(&rule.kind);
        }
    }

    // Keyword catalog: the kind with the most hits wins; ties resolve by
    // kind name so classification stays deterministic.
    let mut best: Option<(usize, String)> = None;
    for (kind, keywords) in &config.keywords {
        let hits = keywords
            .iter()
            .filter(|k| lower.contains(&k.to_lowercase()))
            .count();
        if hits == 0 {
            continue;
        }
        let replace = match &best {
            None => true,
            Some((best_hits, best_kind)) => {
                hits > *best_hits || (hits == *best_hits && kind < best_kind)
            }
        };
        if replace {
            best = Some((hits, kind.clone()));
        }
    }

    best.map(|(_, kind)| TaskKind::from_str_loose(&kind))
        .unwrap_or(TaskKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    #[test]
    fn explicit_prefix_wins_over_keywords() {
        assert_eq!(classify("ppt: 数据统计", &config()), TaskKind::Presentation);
        assert_eq!(classify("SQL: anything at all", &config()), TaskKind::DataQuery);
    }

    #[test]
    fn keyword_match_classifies_chinese_and_english() {
        assert_eq!(
            classify("请生成本季度增长复盘框架", &config()),
            TaskKind::Presentation
        );
        assert_eq!(
            classify("抓取 https://example.com 并摘要", &config()),
            TaskKind::Research
        );
        assert_eq!(classify("build a slide deck", &config()), TaskKind::Presentation);
    }

    #[test]
    fn unmatched_text_routes_to_other() {
        assert_eq!(classify("hello there", &config()), TaskKind::Other);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "查询数据 and research 分析";
        let first = classify(text, &config());
        for _ in 0..10 {
            assert_eq!(classify(text, &config()), first);
        }
    }
}
