//! Feedback ingestion and the controlled learning loop.

pub mod tuner;

pub use tuner::{Proposal, Tuner, TunerReport};

use chrono::Utc;
use std::sync::Arc;

use crate::errors::{KernelError, KernelResult};
use crate::store::StateStore;
use crate::types::FeedbackRecord;

/// Append-only feedback ingestion. Records may arrive out of order with
/// respect to runs; the tuner orders by `submitted_at`.
pub struct FeedbackService {
    store: Arc<StateStore>,
}

impl std::fmt::Debug for FeedbackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackService").finish()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub positive: u64,
    pub negative: u64,
    pub unprocessed: u64,
}

impl FeedbackService {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn add(&self, run_id: &str, rating: i8, note: Option<String>) -> KernelResult<FeedbackRecord> {
        if rating != 1 && rating != -1 {
            return Err(KernelError::Config(format!(
                "rating must be +1 or -1, got {}",
                rating
            )));
        }
        if self.store.index().run(run_id)?.is_none() {
            return Err(KernelError::UnknownRun(run_id.to_string()));
        }
        let record = FeedbackRecord {
            run_id: run_id.to_string(),
            rating,
            note,
            submitted_at: Utc::now(),
            processed: false,
        };
        self.store.add_feedback(&record)?;
        Ok(record)
    }

    pub fn stats(&self) -> KernelResult<FeedbackStats> {
        let (total, positive, unprocessed) = self.store.index().feedback_stats()?;
        Ok(FeedbackStats {
            total,
            positive,
            negative: total - positive,
            unprocessed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use indexmap::IndexMap;

    fn store_with_run() -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        let task = TaskSpec {
            task_id: "task-1".into(),
            text: "x".into(),
            task_kind: TaskKind::Other,
            entered_at: Utc::now(),
            origin: Origin::Cli,
            explicit_params: IndexMap::new(),
        };
        let ctx = RunContext {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            profile: Profile::Adaptive,
            allowed_layers: Default::default(),
            blocked_maturity: Default::default(),
            max_risk_level: RiskLevel::Medium,
            deterministic: false,
            learning_enabled: true,
            max_fallback_steps: 3,
            trace_id: "t".into(),
        };
        store.record_submitted(&task, &ctx).unwrap();
        (dir, store)
    }

    #[test]
    fn add_validates_rating_and_run() {
        let (_dir, store) = store_with_run();
        let service = FeedbackService::new(Arc::clone(&store));

        assert!(service.add("run-1", 1, None).is_ok());
        assert!(service.add("run-1", 0, None).is_err());
        assert!(service.add("run-missing", 1, None).is_err());

        let stats = service.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.unprocessed, 1);
    }
}
