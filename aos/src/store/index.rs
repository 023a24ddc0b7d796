//! Small relational index over the event logs.
//!
//! The JSONL logs are the source of truth; this SQLite database is a
//! rebuildable cache for latest-per-key lookups and window aggregates, so
//! in-place updates here do not violate the append-only storage contract.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::{KernelError, KernelResult};
use crate::types::{
    ExecutionAttempt, RunContext, RunSummary, TaskKind, TaskSpec,
};

/// Newtype wrapping `Connection` in a `Mutex` so the index is both `Send`
/// and `Sync`. `rusqlite::Connection` is `Send` but not `Sync`; `Mutex<T>`
/// is `Sync` whenever `T: Send`.
struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id           TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL,
    task_kind        TEXT NOT NULL,
    profile          TEXT NOT NULL,
    outcome          TEXT,
    chosen_strategy  TEXT,
    attempts_count   INTEGER NOT NULL DEFAULT 0,
    total_latency_ms INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT,
    submitted_at     INTEGER NOT NULL,
    sealed_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_runs_kind      ON runs(task_kind);
CREATE INDEX IF NOT EXISTS idx_runs_submitted ON runs(submitted_at);

CREATE TABLE IF NOT EXISTS attempts (
    attempt_id  TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    task_kind   TEXT NOT NULL,
    position    INTEGER NOT NULL,
    status      TEXT NOT NULL,
    error_kind  TEXT,
    latency_ms  INTEGER NOT NULL,
    retries     INTEGER NOT NULL,
    started_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_run      ON attempts(run_id);
CREATE INDEX IF NOT EXISTS idx_attempts_strategy ON attempts(strategy_id);
CREATE INDEX IF NOT EXISTS idx_attempts_started  ON attempts(started_at);

CREATE TABLE IF NOT EXISTS feedback (
    run_id       TEXT NOT NULL,
    rating       INTEGER NOT NULL,
    submitted_at INTEGER NOT NULL,
    processed    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_feedback_run ON feedback(run_id);
";

/// Snapshot of a run row, used by `status`, `inspect` and `observe`.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub task_id: String,
    pub task_kind: TaskKind,
    pub profile: String,
    pub outcome: Option<String>,
    pub chosen_strategy: Option<String>,
    pub attempts_count: u64,
    pub total_latency_ms: u64,
    pub last_error: Option<String>,
    pub submitted_at: i64,
    pub sealed_at: Option<i64>,
}

/// Window aggregate for one (strategy, task_kind) group.
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub attempts: u64,
    pub successes: u64,
    pub p95_latency_ms: u64,
    /// Attempts that ran at plan position > 0.
    pub fallback_attempts: u64,
    /// Attempts whose error kind is in the configured P1/P2 set.
    pub p1_breaches: u64,
}

impl WindowStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn fallback_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.fallback_attempts as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug)]
pub struct RunIndex {
    conn: DbConn,
}

impl RunIndex {
    pub fn open(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(Self {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> KernelResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|_| KernelError::Store("index connection poisoned".into()))
    }

    pub fn record_submitted(&self, task: &TaskSpec, ctx: &RunContext) -> KernelResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO runs \
             (run_id, task_id, task_kind, profile, submitted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ctx.run_id,
                task.task_id,
                task.task_kind.as_str(),
                ctx.profile.as_str(),
                task.entered_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn record_attempt(&self, attempt: &ExecutionAttempt, kind: TaskKind) -> KernelResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO attempts \
             (attempt_id, run_id, strategy_id, task_kind, position, status, \
              error_kind, latency_ms, retries, started_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                attempt.attempt_id,
                attempt.run_id,
                attempt.strategy_id,
                kind.as_str(),
                attempt.position as i64,
                attempt.status.as_str(),
                attempt.error_kind.map(|k| k.as_str()),
                attempt.telemetry.latency_ms as i64,
                attempt.telemetry.retries as i64,
                attempt.started_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn record_sealed(&self, summary: &RunSummary) -> KernelResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET outcome = ?2, chosen_strategy = ?3, attempts_count = ?4, \
             total_latency_ms = ?5, last_error = ?6, sealed_at = ?7 WHERE run_id = ?1",
            params![
                summary.run_id,
                summary.outcome.as_str(),
                summary.chosen_strategy,
                summary.attempts_count as i64,
                summary.total_latency_ms as i64,
                summary.last_error.map(|k| k.as_str()),
                summary.sealed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn record_feedback(
        &self,
        run_id: &str,
        rating: i8,
        submitted_at: DateTime<Utc>,
    ) -> KernelResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO feedback (run_id, rating, submitted_at) VALUES (?1, ?2, ?3)",
            params![run_id, rating as i64, submitted_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn mark_feedback_processed(&self, up_to: DateTime<Utc>) -> KernelResult<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE feedback SET processed = 1 WHERE processed = 0 AND submitted_at <= ?1",
            params![up_to.timestamp_millis()],
        )?;
        Ok(n)
    }

    pub fn feedback_stats(&self) -> KernelResult<(u64, u64, u64)> {
        let conn = self.lock()?;
        let (total, positive, unprocessed) = conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN rating > 0 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN processed = 0 THEN 1 ELSE 0 END), 0) \
             FROM feedback",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        Ok((total as u64, positive as u64, unprocessed as u64))
    }

    fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
        Ok(RunRow {
            run_id: row.get(0)?,
            task_id: row.get(1)?,
            task_kind: TaskKind::from_str_loose(&row.get::<_, String>(2)?),
            profile: row.get(3)?,
            outcome: row.get(4)?,
            chosen_strategy: row.get(5)?,
            attempts_count: row.get::<_, i64>(6)? as u64,
            total_latency_ms: row.get::<_, i64>(7)? as u64,
            last_error: row.get(8)?,
            submitted_at: row.get(9)?,
            sealed_at: row.get(10)?,
        })
    }

    const RUN_COLUMNS: &'static str = "run_id, task_id, task_kind, profile, outcome, \
         chosen_strategy, attempts_count, total_latency_ms, last_error, submitted_at, sealed_at";

    pub fn run(&self, run_id: &str) -> KernelResult<Option<RunRow>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM runs WHERE run_id = ?1", Self::RUN_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![run_id], Self::row_from)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Latest sealed run per task kind.
    pub fn latest_run_for_kind(&self, kind: TaskKind) -> KernelResult<Option<RunRow>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM runs WHERE task_kind = ?1 AND sealed_at IS NOT NULL \
             ORDER BY sealed_at DESC LIMIT 1",
            Self::RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![kind.as_str()], Self::row_from)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn recent_runs(&self, limit: usize) -> KernelResult<Vec<RunRow>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM runs ORDER BY submitted_at DESC LIMIT ?1",
            Self::RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], Self::row_from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Distinct (strategy_id, task_kind) groups with attempts since `since`.
    pub fn active_groups(&self, since: DateTime<Utc>) -> KernelResult<Vec<(String, TaskKind)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT strategy_id, task_kind FROM attempts WHERE started_at >= ?1",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                TaskKind::from_str_loose(&row.get::<_, String>(1)?),
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Window aggregate for one (strategy, task_kind) group.
    pub fn window_stats(
        &self,
        strategy_id: &str,
        kind: Option<TaskKind>,
        since: DateTime<Utc>,
        p1_error_kinds: &[String],
    ) -> KernelResult<WindowStats> {
        let conn = self.lock()?;
        let kind_str = kind.map(|k| k.as_str().to_string());
        let mut stmt = conn.prepare(
            "SELECT status, error_kind, latency_ms, position FROM attempts \
             WHERE strategy_id = ?1 AND started_at >= ?2 \
               AND (?3 IS NULL OR task_kind = ?3)",
        )?;
        let rows = stmt.query_map(
            params![strategy_id, since.timestamp_millis(), kind_str],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut stats = WindowStats::default();
        let mut latencies: Vec<i64> = Vec::new();
        for row in rows {
            let (status, error_kind, latency_ms, position) = row?;
            stats.attempts += 1;
            if status == "succeeded" {
                stats.successes += 1;
            }
            if position > 0 {
                stats.fallback_attempts += 1;
            }
            if let Some(kind) = error_kind {
                if p1_error_kinds.iter().any(|p| p == &kind) {
                    stats.p1_breaches += 1;
                }
            }
            latencies.push(latency_ms);
        }
        stats.p95_latency_ms = percentile(&mut latencies, 0.95);
        Ok(stats)
    }

    /// (strategy_id, error_kind, count) ordered by count, for the failure TopN.
    pub fn failure_hotspots(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> KernelResult<Vec<(String, String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT strategy_id, error_kind, COUNT(*) AS n FROM attempts \
             WHERE started_at >= ?1 AND error_kind IS NOT NULL \
             GROUP BY strategy_id, error_kind ORDER BY n DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Overall (attempts, successes, p95) across all strategies since `since`.
    pub fn slo_aggregate(&self, since: DateTime<Utc>) -> KernelResult<WindowStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, latency_ms, position FROM attempts WHERE started_at >= ?1",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut stats = WindowStats::default();
        let mut latencies = Vec::new();
        for row in rows {
            let (status, latency_ms, position) = row?;
            stats.attempts += 1;
            if status == "succeeded" {
                stats.successes += 1;
            }
            if position > 0 {
                stats.fallback_attempts += 1;
            }
            latencies.push(latency_ms);
        }
        stats.p95_latency_ms = percentile(&mut latencies, 0.95);
        Ok(stats)
    }
}

fn percentile(values: &mut [i64], q: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let rank = ((values.len() as f64) * q).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)].max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;

    fn spec_and_ctx(kind: TaskKind) -> (TaskSpec, RunContext) {
        let task = TaskSpec {
            task_id: "task-1".into(),
            text: "quarterly review deck".into(),
            task_kind: kind,
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
        (task, ctx)
    }

    fn attempt(run: &str, strategy: &str, position: usize, status: AttemptStatus) -> ExecutionAttempt {
        ExecutionAttempt {
            attempt_id: format!("{}-{}", run, position),
            run_id: run.into(),
            strategy_id: strategy.into(),
            position,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            status,
            error_kind: (status == AttemptStatus::Failed)
                .then_some(crate::errors::ErrorKind::ToolTimeout),
            error_message: None,
            artifacts: vec![],
            advisory: false,
            telemetry: AttemptTelemetry {
                latency_ms: 120,
                retries: 0,
                fallbacks_used: 0,
            },
            reflection: Reflection::default(),
        }
    }

    #[test]
    fn submitted_then_sealed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = RunIndex::open(dir.path().join("index.sqlite3")).unwrap();
        let (task, ctx) = spec_and_ctx(TaskKind::Presentation);
        index.record_submitted(&task, &ctx).unwrap();

        let row = index.run("run-1").unwrap().unwrap();
        assert_eq!(row.outcome, None);

        index
            .record_sealed(&RunSummary {
                run_id: "run-1".into(),
                task_id: "task-1".into(),
                outcome: RunOutcome::Succeeded,
                chosen_strategy: Some("deck.outline".into()),
                attempts_count: 1,
                total_latency_ms: 321,
                delivery_bundle_ref: None,
                last_error: None,
                sealed_at: Utc::now(),
            })
            .unwrap();

        let row = index.run("run-1").unwrap().unwrap();
        assert_eq!(row.outcome.as_deref(), Some("succeeded"));
        assert_eq!(row.chosen_strategy.as_deref(), Some("deck.outline"));

        let latest = index.latest_run_for_kind(TaskKind::Presentation).unwrap();
        assert_eq!(latest.unwrap().run_id, "run-1");
    }

    #[test]
    fn window_stats_aggregate_success_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let index = RunIndex::open(dir.path().join("index.sqlite3")).unwrap();
        index
            .record_attempt(
                &attempt("run-1", "web.fetch", 0, AttemptStatus::Failed),
                TaskKind::Research,
            )
            .unwrap();
        index
            .record_attempt(
                &attempt("run-1", "web.search", 1, AttemptStatus::Succeeded),
                TaskKind::Research,
            )
            .unwrap();
        index
            .record_attempt(
                &attempt("run-2", "web.search", 0, AttemptStatus::Succeeded),
                TaskKind::Research,
            )
            .unwrap();

        let since = Utc::now() - chrono::Duration::days(1);
        let stats = index
            .window_stats("web.search", Some(TaskKind::Research), since, &[])
            .unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.fallback_attempts, 1);
        assert_eq!(stats.p95_latency_ms, 120);

        let hotspots = index.failure_hotspots(since, 5).unwrap();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].0, "web.fetch");
        assert_eq!(hotspots[0].1, "tool_timeout");
    }

    #[test]
    fn feedback_marking() {
        let dir = tempfile::tempdir().unwrap();
        let index = RunIndex::open(dir.path().join("index.sqlite3")).unwrap();
        index.record_feedback("run-1", 1, Utc::now()).unwrap();
        index.record_feedback("run-2", -1, Utc::now()).unwrap();
        let (total, positive, unprocessed) = index.feedback_stats().unwrap();
        assert_eq!((total, positive, unprocessed), (2, 1, 2));
        index.mark_feedback_processed(Utc::now()).unwrap();
        let (_, _, unprocessed) = index.feedback_stats().unwrap();
        assert_eq!(unprocessed, 0);
    }
}
