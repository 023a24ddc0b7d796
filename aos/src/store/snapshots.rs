//! Ordered, reversible log of policy override snapshots.
//!
//! Apply and rollback are both appends; prior snapshots are never mutated.
//! Each snapshot carries the complete effective override set after its
//! action, which makes "restore the set recorded at snapshot S" a plain read.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::errors::{KernelError, KernelResult};
use crate::store::ledger::EventLog;
use crate::types::{OverrideScope, OverrideSnapshot, PolicyOverride, SnapshotId};

/// Requested change; a `null` value removes the (scope, key) entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideChange {
    pub scope: OverrideScope,
    pub key: String,
    pub value: serde_json::Value,
}

/// Added/removed report produced by a rollback (or rendered for `policy show`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideDiff {
    pub added: Vec<PolicyOverride>,
    pub removed: Vec<PolicyOverride>,
}

#[derive(Debug)]
pub struct SnapshotLog {
    log: EventLog<OverrideSnapshot>,
}

impl SnapshotLog {
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> KernelResult<Self> {
        Ok(Self {
            log: EventLog::open(path, fsync)?,
        })
    }

    pub fn list(&self) -> KernelResult<Vec<OverrideSnapshot>> {
        Ok(self.log.read_all()?.into_iter().map(|e| e.event).collect())
    }

    pub fn get(&self, snapshot_id: &str) -> KernelResult<Option<OverrideSnapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|s| s.snapshot_id == snapshot_id))
    }

    /// The currently effective override set (empty before any snapshot).
    pub fn active_set(&self) -> KernelResult<Vec<PolicyOverride>> {
        Ok(self
            .list()?
            .into_iter()
            .last()
            .map(|s| s.overrides)
            .unwrap_or_default())
    }

    /// Append an apply-snapshot merging `changes` into the active set.
    pub fn apply(
        &self,
        changes: &[OverrideChange],
        approved_by: &str,
    ) -> KernelResult<OverrideSnapshot> {
        let snapshot_id: SnapshotId = format!("snap-{}", Uuid::new_v4());
        let applied_at = Utc::now();
        let mut effective = self.active_set()?;

        for change in changes {
            effective.retain(|o| !(o.scope == change.scope && o.key == change.key));
            if !change.value.is_null() {
                effective.push(PolicyOverride {
                    scope: change.scope,
                    key: change.key.clone(),
                    value: change.value.clone(),
                    snapshot_id: snapshot_id.clone(),
                    applied_at,
                    approved_by: approved_by.to_string(),
                });
            }
        }

        let snapshot = OverrideSnapshot {
            snapshot_id,
            applied_at,
            approved_by: approved_by.to_string(),
            action: "apply".to_string(),
            overrides: effective,
        };
        self.log.append(&snapshot)?;
        Ok(snapshot)
    }

    /// Append a rollback-snapshot restoring the set recorded at `target`.
    /// Returns the new snapshot and the added/removed diff against the set
    /// that was active before the rollback.
    pub fn rollback(
        &self,
        target: &str,
        approved_by: &str,
    ) -> KernelResult<(OverrideSnapshot, OverrideDiff)> {
        let restored = self
            .get(target)?
            .ok_or_else(|| KernelError::UnknownSnapshot(target.to_string()))?;
        let before = self.active_set()?;

        let snapshot = OverrideSnapshot {
            snapshot_id: format!("snap-{}", Uuid::new_v4()),
            applied_at: Utc::now(),
            approved_by: approved_by.to_string(),
            action: format!("rollback:{}", target),
            overrides: restored.overrides.clone(),
        };
        self.log.append(&snapshot)?;

        let diff = diff_sets(&before, &snapshot.overrides);
        Ok((snapshot, diff))
    }
}

fn contains(set: &[PolicyOverride], entry: &PolicyOverride) -> bool {
    set.iter()
        .any(|o| o.scope == entry.scope && o.key == entry.key && o.value == entry.value)
}

/// Entries in `after` not in `before` (added) and vice versa (removed).
pub fn diff_sets(before: &[PolicyOverride], after: &[PolicyOverride]) -> OverrideDiff {
    OverrideDiff {
        added: after
            .iter()
            .filter(|o| !contains(before, o))
            .cloned()
            .collect(),
        removed: before
            .iter()
            .filter(|o| !contains(after, o))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(key: &str, value: serde_json::Value) -> OverrideChange {
        OverrideChange {
            scope: OverrideScope::Strategy,
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn apply_merges_by_scope_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("overrides.jsonl"), true).unwrap();

        log.apply(&[change("web.fetch.execution_mode", json!("advisor"))], "tuner")
            .unwrap();
        log.apply(&[change("web.fetch.execution_mode", json!("operator"))], "operator")
            .unwrap();

        let active = log.active_set().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].value, json!("operator"));
    }

    #[test]
    fn null_value_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("overrides.jsonl"), true).unwrap();
        log.apply(&[change("x.demoted", json!(true))], "tuner").unwrap();
        log.apply(&[change("x.demoted", serde_json::Value::Null)], "operator")
            .unwrap();
        assert!(log.active_set().unwrap().is_empty());
    }

    #[test]
    fn rollback_restores_the_set_recorded_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("overrides.jsonl"), true).unwrap();

        let s1 = log
            .apply(&[change("a.demoted", json!(true))], "tuner")
            .unwrap();
        log.apply(&[change("b.demoted", json!(true))], "tuner").unwrap();
        assert_eq!(log.active_set().unwrap().len(), 2);

        let (_snap, diff) = log.rollback(&s1.snapshot_id, "operator").unwrap();
        let active = log.active_set().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "a.demoted");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].key, "b.demoted");
        assert!(diff.added.is_empty());
    }

    #[test]
    fn rollback_to_unknown_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("overrides.jsonl"), true).unwrap();
        assert!(log.rollback("snap-missing", "operator").is_err());
    }
}
