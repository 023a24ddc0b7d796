//! Durable, append-mostly evidence store.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   events/        append-only JSONL logs (runs, attempts, feedback, ...)
//!   artifacts/     content-addressed store, artifacts/<2-hex>/<sha256>
//!   state/         small serialized state files (breaker map, counters)
//!   index.sqlite3  rebuildable relational index for fast lookups
//! ```
//!
//! The logs are the source of truth and are never updated in place. The
//! store is the single owner of persisted entities; other components hold
//! read-only views or append-only handles to it.

pub mod artifacts;
pub mod ledger;
pub mod snapshots;

mod index;

pub use artifacts::{hex_sha256, ArtifactStore};
pub use index::{RunIndex, RunRow, WindowStats};
pub use ledger::{EventEnvelope, EventLog, SCHEMA_VERSION};
pub use snapshots::{OverrideChange, OverrideDiff, SnapshotLog};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::StoreConfig;
use crate::errors::{KernelError, KernelResult};
use crate::types::{
    ArtifactKind, ArtifactRef, DeliveryBundle, EvaluationRecord, ExecutionAttempt,
    ExecutionPlan, FeedbackRecord, RunContext, RunSummary, TaskKind, TaskSpec, TelemetryEvent,
    ToolCallRecord,
};

/// Run-lifecycle events on the `runs` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Submitted {
        task: TaskSpec,
        context: RunContext,
    },
    PlanBuilt {
        plan: ExecutionPlan,
    },
    Sealed {
        summary: RunSummary,
        bundle: DeliveryBundle,
    },
}

/// Feedback ingestion events; processing is itself an append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedbackEvent {
    Added { record: FeedbackRecord },
    Processed { up_to: DateTime<Utc> },
}

#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    runs: EventLog<RunEvent>,
    attempts: EventLog<ExecutionAttempt>,
    feedback: EventLog<FeedbackEvent>,
    telemetry: EventLog<TelemetryEvent>,
    toolcalls: EventLog<ToolCallRecord>,
    evaluations: EventLog<EvaluationRecord>,
    artifacts: ArtifactStore,
    index: RunIndex,
    snapshots: SnapshotLog,
}

impl StateStore {
    pub fn open(config: &StoreConfig) -> KernelResult<Self> {
        Self::open_at(Path::new(&config.root), config.fsync)
    }

    pub fn open_at(root: &Path, fsync: bool) -> KernelResult<Self> {
        let events = root.join("events");
        fs::create_dir_all(&events)?;
        fs::create_dir_all(root.join("state"))?;

        Ok(Self {
            root: root.to_path_buf(),
            runs: EventLog::open(events.join("runs.jsonl"), fsync)?,
            attempts: EventLog::open(events.join("attempts.jsonl"), fsync)?,
            feedback: EventLog::open(events.join("feedback.jsonl"), fsync)?,
            telemetry: EventLog::open(events.join("telemetry.jsonl"), fsync)?,
            toolcalls: EventLog::open(events.join("toolcalls.jsonl"), fsync)?,
            evaluations: EventLog::open(events.join("evaluations.jsonl"), fsync)?,
            artifacts: ArtifactStore::new(root.join("artifacts"))?,
            index: RunIndex::open(root.join("index.sqlite3"))?,
            snapshots: SnapshotLog::open(events.join("overrides.jsonl"), fsync)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    pub fn record_submitted(&self, task: &TaskSpec, ctx: &RunContext) -> KernelResult<()> {
        self.runs.append(&RunEvent::Submitted {
            task: task.clone(),
            context: ctx.clone(),
        })?;
        self.index.record_submitted(task, ctx)
    }

    pub fn record_plan(&self, plan: &ExecutionPlan) -> KernelResult<()> {
        self.runs
            .append(&RunEvent::PlanBuilt { plan: plan.clone() })?;
        Ok(())
    }

    /// Persist one attempt; called before the next attempt may begin.
    pub fn record_attempt(&self, attempt: &ExecutionAttempt, kind: TaskKind) -> KernelResult<()> {
        self.attempts.append(attempt)?;
        self.index.record_attempt(attempt, kind)
    }

    /// Seal a run: verify every referenced artifact hash-matches, store the
    /// delivery bundle as a content-addressed artifact, then append the
    /// terminal record. Returns the summary with the bundle reference set.
    pub fn seal_run(
        &self,
        mut summary: RunSummary,
        bundle: &DeliveryBundle,
        referenced: &[ArtifactRef],
    ) -> KernelResult<RunSummary> {
        for artifact in referenced {
            if !self.artifacts.verify(artifact)? {
                return Err(KernelError::Store(format!(
                    "artifact {} failed hash verification at seal time",
                    artifact.sha256
                )));
            }
        }

        let bundle_bytes = serde_json::to_vec_pretty(bundle)?;
        let bundle_ref = self.artifacts.put(
            &bundle_bytes,
            ArtifactKind::Json,
            &"kernel.delivery".to_string(),
        )?;
        summary.delivery_bundle_ref = Some(bundle_ref);

        self.runs.append(&RunEvent::Sealed {
            summary: summary.clone(),
            bundle: bundle.clone(),
        })?;
        self.index.record_sealed(&summary)?;
        Ok(summary)
    }

    pub fn run_events(&self, run_id: &str) -> KernelResult<Vec<RunEvent>> {
        Ok(self
            .runs
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .filter(|e| match e {
                RunEvent::Submitted { context, .. } => context.run_id == run_id,
                RunEvent::PlanBuilt { plan } => plan.run_id == run_id,
                RunEvent::Sealed { summary, .. } => summary.run_id == run_id,
            })
            .collect())
    }

    pub fn sealed_summary(
        &self,
        run_id: &str,
    ) -> KernelResult<Option<(RunSummary, DeliveryBundle)>> {
        for event in self.run_events(run_id)? {
            if let RunEvent::Sealed { summary, bundle } = event {
                return Ok(Some((summary, bundle)));
            }
        }
        Ok(None)
    }

    pub fn attempts_for_run(&self, run_id: &str) -> KernelResult<Vec<ExecutionAttempt>> {
        let mut attempts: Vec<ExecutionAttempt> = self
            .attempts
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .filter(|a| a.run_id == run_id)
            .collect();
        attempts.sort_by_key(|a| a.position);
        Ok(attempts)
    }

    // ------------------------------------------------------------------
    // Feedback / evaluations / telemetry / tool calls
    // ------------------------------------------------------------------

    pub fn add_feedback(&self, record: &FeedbackRecord) -> KernelResult<()> {
        self.feedback.append(&FeedbackEvent::Added {
            record: record.clone(),
        })?;
        self.index
            .record_feedback(&record.run_id, record.rating, record.submitted_at)
    }

    pub fn mark_feedback_processed(&self, up_to: DateTime<Utc>) -> KernelResult<usize> {
        self.feedback.append(&FeedbackEvent::Processed { up_to })?;
        self.index.mark_feedback_processed(up_to)
    }

    pub fn feedback_records(&self) -> KernelResult<Vec<FeedbackRecord>> {
        let mut processed_up_to: Option<DateTime<Utc>> = None;
        let mut records = Vec::new();
        for envelope in self.feedback.read_all()? {
            match envelope.event {
                FeedbackEvent::Added { record } => records.push(record),
                FeedbackEvent::Processed { up_to } => {
                    processed_up_to = Some(processed_up_to.map_or(up_to, |p| p.max(up_to)))
                }
            }
        }
        if let Some(up_to) = processed_up_to {
            for record in &mut records {
                if record.submitted_at <= up_to {
                    record.processed = true;
                }
            }
        }
        Ok(records)
    }

    pub fn record_evaluation(&self, record: &EvaluationRecord) -> KernelResult<()> {
        self.evaluations.append(record)?;
        Ok(())
    }

    pub fn evaluations(&self) -> KernelResult<Vec<EvaluationRecord>> {
        Ok(self
            .evaluations
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .collect())
    }

    pub fn record_telemetry(&self, event: &TelemetryEvent) -> KernelResult<()> {
        self.telemetry.append(event)?;
        Ok(())
    }

    pub fn telemetry_events(&self) -> KernelResult<Vec<TelemetryEvent>> {
        Ok(self
            .telemetry
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .collect())
    }

    pub fn record_tool_call(&self, record: &ToolCallRecord) -> KernelResult<()> {
        self.toolcalls.append(record)?;
        Ok(())
    }

    pub fn tool_calls_for_run(&self, run_id: &str) -> KernelResult<Vec<ToolCallRecord>> {
        Ok(self
            .toolcalls
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .filter(|r| r.run_id == run_id)
            .collect())
    }

    pub fn tool_calls_since(&self, since: DateTime<Utc>) -> KernelResult<Vec<ToolCallRecord>> {
        Ok(self
            .toolcalls
            .read_all()?
            .into_iter()
            .map(|e| e.event)
            .filter(|r| r.ts >= since)
            .collect())
    }

    pub fn find_tool_call(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> KernelResult<Option<ToolCallRecord>> {
        Ok(self
            .tool_calls_for_run(run_id)?
            .into_iter()
            .find(|r| r.step_id == step_id))
    }

    // ------------------------------------------------------------------
    // Sub-store access
    // ------------------------------------------------------------------

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn index(&self) -> &RunIndex {
        &self.index
    }

    pub fn snapshots(&self) -> &SnapshotLog {
        &self.snapshots
    }

    // ------------------------------------------------------------------
    // Small state files (breaker map etc.)
    // ------------------------------------------------------------------

    /// Atomically persist a small state file under `state/`.
    pub fn save_state_file<T: Serialize>(&self, name: &str, value: &T) -> KernelResult<()> {
        let dir = self.root.join("state");
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        let tmp = dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_state_file<T: DeserializeOwned>(&self, name: &str) -> KernelResult<Option<T>> {
        let path = self.root.join("state").join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    // ------------------------------------------------------------------
    // Integrity / backup
    // ------------------------------------------------------------------

    /// Verify the hash chain of every event log. Returns `(log, first bad
    /// seq)` pairs; an empty vec means every chain is intact.
    pub fn verify_integrity(&self) -> KernelResult<Vec<(String, u64)>> {
        let mut failures = Vec::new();
        let checks: Vec<(&str, Option<u64>)> = vec![
            ("runs", self.runs.verify_integrity()?),
            ("attempts", self.attempts.verify_integrity()?),
            ("feedback", self.feedback.verify_integrity()?),
            ("telemetry", self.telemetry.verify_integrity()?),
            ("toolcalls", self.toolcalls.verify_integrity()?),
            ("evaluations", self.evaluations.verify_integrity()?),
        ];
        for (name, bad_seq) in checks {
            if let Some(seq) = bad_seq {
                failures.push((name.to_string(), seq));
            }
        }
        Ok(failures)
    }

    /// Copy events, artifacts and state into `dest` along with a manifest
    /// carrying per-file hashes, an overall integrity hash and the schema
    /// version fingerprint.
    pub fn backup(&self, dest: &Path) -> KernelResult<BackupManifest> {
        fs::create_dir_all(dest)?;
        let mut files = Vec::new();
        for sub in ["events", "artifacts", "state"] {
            let src_dir = self.root.join(sub);
            if src_dir.exists() {
                copy_tree(&src_dir, &dest.join(sub), &self.root, &mut files)?;
            }
        }
        let index_src = self.root.join("index.sqlite3");
        if index_src.exists() {
            let bytes = fs::read(&index_src)?;
            fs::write(dest.join("index.sqlite3"), &bytes)?;
            files.push(("index.sqlite3".to_string(), hex_sha256(&bytes)));
        }

        files.sort();
        let manifest = BackupManifest {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            integrity: manifest_integrity(&files),
            files,
        };
        fs::write(
            dest.join("manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(manifest)
    }

    /// Restore a backup into a fresh root, verifying the manifest integrity
    /// hash and schema fingerprint first.
    pub fn restore(src: &Path, root: &Path) -> KernelResult<()> {
        let manifest: BackupManifest =
            serde_json::from_slice(&fs::read(src.join("manifest.json"))?)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(KernelError::Store(format!(
                "backup schema version {} does not match runtime {}",
                manifest.schema_version, SCHEMA_VERSION
            )));
        }

        let mut files = Vec::new();
        for (rel, expected) in &manifest.files {
            let bytes = fs::read(src.join(rel))?;
            let actual = hex_sha256(&bytes);
            if &actual != expected {
                return Err(KernelError::Store(format!(
                    "backup file {} failed hash verification",
                    rel
                )));
            }
            files.push((rel.clone(), actual));
        }
        files.sort();
        if manifest_integrity(&files) != manifest.integrity {
            return Err(KernelError::Store(
                "backup manifest integrity hash mismatch".into(),
            ));
        }

        for (rel, _) in &manifest.files {
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(src.join(rel), dest)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    /// Hash over the sorted `path:hash` list.
    pub integrity: String,
    pub files: Vec<(String, String)>,
}

fn manifest_integrity(files: &[(String, String)]) -> String {
    let joined: String = files
        .iter()
        .map(|(p, h)| format!("{}:{}\n", p, h))
        .collect();
    hex_sha256(joined.as_bytes())
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    rel_base: &Path,
    files: &mut Vec<(String, String)>,
) -> KernelResult<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            copy_tree(&path, &dest.join(entry.file_name()), rel_base, files)?;
        } else {
            let bytes = fs::read(&path)?;
            fs::write(dest.join(entry.file_name()), &bytes)?;
            let rel = path
                .strip_prefix(rel_base)
                .map_err(|e| KernelError::Store(e.to_string()))?
                .to_string_lossy()
                .to_string();
            files.push((rel, hex_sha256(&bytes)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;

    fn open_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_at(dir.path(), true).unwrap();
        (dir, store)
    }

    fn sample_run(store: &StateStore) -> (TaskSpec, RunContext) {
        let task = TaskSpec {
            task_id: "task-1".into(),
            text: "draft a review deck".into(),
            task_kind: TaskKind::Presentation,
            entered_at: Utc::now(),
            origin: Origin::Cli,
            explicit_params: Default::default(),
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
            trace_id: "trace-1".into(),
        };
        store.record_submitted(&task, &ctx).unwrap();
        (task, ctx)
    }

    #[test]
    fn seal_run_stores_bundle_and_verifies_artifacts() {
        let (_dir, store) = open_store();
        sample_run(&store);

        let artifact = store
            .artifacts()
            .put(b"outline", ArtifactKind::Md, &"deck.outline".to_string())
            .unwrap();
        let bundle = DeliveryBundle {
            run_id: "run-1".into(),
            headline: "Deck outline ready".into(),
            clarification_questions: vec![],
            assumptions: vec![],
            primary_artifact: Some(artifact.clone()),
            supporting_artifacts: vec![],
            why_failed: None,
            retry_options: vec![],
        };
        let summary = RunSummary {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            outcome: RunOutcome::Succeeded,
            chosen_strategy: Some("deck.outline".into()),
            attempts_count: 1,
            total_latency_ms: 100,
            delivery_bundle_ref: None,
            last_error: None,
            sealed_at: Utc::now(),
        };

        let sealed = store
            .seal_run(summary, &bundle, std::slice::from_ref(&artifact))
            .unwrap();
        assert!(sealed.delivery_bundle_ref.is_some());

        let (summary, bundle) = store.sealed_summary("run-1").unwrap().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(bundle.primary_artifact.unwrap().sha256, artifact.sha256);
        assert!(store.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn seal_run_rejects_tampered_artifact() {
        let (_dir, store) = open_store();
        sample_run(&store);
        let artifact = store
            .artifacts()
            .put(b"data", ArtifactKind::Json, &"s".to_string())
            .unwrap();
        std::fs::write(&artifact.uri, b"tampered").unwrap();

        let bundle = DeliveryBundle {
            run_id: "run-1".into(),
            headline: "x".into(),
            clarification_questions: vec![],
            assumptions: vec![],
            primary_artifact: Some(artifact.clone()),
            supporting_artifacts: vec![],
            why_failed: None,
            retry_options: vec![],
        };
        let summary = RunSummary {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            outcome: RunOutcome::Succeeded,
            chosen_strategy: None,
            attempts_count: 1,
            total_latency_ms: 0,
            delivery_bundle_ref: None,
            last_error: None,
            sealed_at: Utc::now(),
        };
        assert!(store.seal_run(summary, &bundle, &[artifact]).is_err());
    }

    #[test]
    fn feedback_processing_is_append_only() {
        let (_dir, store) = open_store();
        store
            .add_feedback(&FeedbackRecord {
                run_id: "run-1".into(),
                rating: 1,
                note: None,
                submitted_at: Utc::now(),
                processed: false,
            })
            .unwrap();
        store.mark_feedback_processed(Utc::now()).unwrap();
        let records = store.feedback_records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].processed);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let (_dir, store) = open_store();
        sample_run(&store);
        store
            .artifacts()
            .put(b"blob", ArtifactKind::Binary, &"s".to_string())
            .unwrap();

        let backup_dir = tempfile::tempdir().unwrap();
        let manifest = store.backup(backup_dir.path()).unwrap();
        assert!(!manifest.files.is_empty());

        let restore_dir = tempfile::tempdir().unwrap();
        StateStore::restore(backup_dir.path(), restore_dir.path()).unwrap();
        let restored = StateStore::open_at(restore_dir.path(), true).unwrap();
        assert!(restored.sealed_summary("run-1").unwrap().is_none());
        assert_eq!(restored.run_events("run-1").unwrap().len(), 1);
        assert!(restored.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn restore_rejects_corrupted_backup() {
        let (_dir, store) = open_store();
        sample_run(&store);
        let backup_dir = tempfile::tempdir().unwrap();
        store.backup(backup_dir.path()).unwrap();

        // Corrupt a backed-up log without touching the manifest.
        let runs = backup_dir.path().join("events").join("runs.jsonl");
        let mut content = std::fs::read_to_string(&runs).unwrap();
        content.push_str("{\"junk\":true}\n");
        std::fs::write(&runs, content).unwrap();

        let restore_dir = tempfile::tempdir().unwrap();
        assert!(StateStore::restore(backup_dir.path(), restore_dir.path()).is_err());
    }
}
