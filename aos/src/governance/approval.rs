//! Signed approval files for operator-mode publish steps.
//!
//! An approval is a small JSON file carrying the approver identity, a
//! monotonic counter and a token: `sha256(secret | approver | counter)`.
//! Verification checks the signature and that the counter is strictly above
//! the last consumed one, so a file cannot be replayed for a second publish.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::store::{hex_sha256, StateStore};

const COUNTER_STATE_FILE: &str = "approval_counter.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalFile {
    pub approver: String,
    pub counter: u64,
    pub token: String,
}

pub fn sign(secret: &str, approver: &str, counter: u64) -> String {
    hex_sha256(format!("{}|{}|{}", secret, approver, counter).as_bytes())
}

/// Write a signed approval file. Exposed for the operator CLI and tests.
pub fn issue(path: &Path, secret: &str, approver: &str, counter: u64) -> KernelResult<ApprovalFile> {
    let approval = ApprovalFile {
        approver: approver.to_string(),
        counter,
        token: sign(secret, approver, counter),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&approval)?)?;
    Ok(approval)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CounterState {
    last_consumed: u64,
}

#[derive(Debug)]
pub struct ApprovalVerifier {
    path: PathBuf,
    secret: Option<String>,
}

impl ApprovalVerifier {
    pub fn new(path: PathBuf, secret: Option<String>) -> Self {
        Self { path, secret }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify and consume the approval file. On success the counter is
    /// recorded through the store, making the same file stale for the next
    /// publish. Every failure maps to `approval_required`.
    pub fn verify_and_consume(&self, store: &StateStore, approver_hint: &str) -> KernelResult<String> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            KernelError::attempt(
                ErrorKind::ApprovalRequired,
                "no approval secret configured; publish steps cannot be approved",
            )
        })?;

        if !self.path.exists() {
            return Err(KernelError::attempt(
                ErrorKind::ApprovalRequired,
                format!(
                    "publish requires a signed approval file at {} ({})",
                    self.path.display(),
                    approver_hint
                ),
            ));
        }

        let raw = std::fs::read(&self.path)?;
        let approval: ApprovalFile = serde_json::from_slice(&raw).map_err(|e| {
            KernelError::attempt(
                ErrorKind::ApprovalRequired,
                format!("approval file is malformed: {}", e),
            )
        })?;

        if approval.token != sign(secret, &approval.approver, approval.counter) {
            return Err(KernelError::attempt(
                ErrorKind::ApprovalRequired,
                "approval token signature mismatch",
            ));
        }

        let state: CounterState = store
            .load_state_file(COUNTER_STATE_FILE)?
            .unwrap_or_default();
        if approval.counter <= state.last_consumed {
            return Err(KernelError::attempt(
                ErrorKind::ApprovalRequired,
                format!(
                    "approval counter {} is stale (last consumed {})",
                    approval.counter, state.last_consumed
                ),
            ));
        }

        store.save_state_file(
            COUNTER_STATE_FILE,
            &CounterState {
                last_consumed: approval.counter,
            },
        )?;
        Ok(approval.approver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StateStore, ApprovalVerifier) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_at(dir.path(), false).unwrap();
        let verifier = ApprovalVerifier::new(
            dir.path().join("approvals/publish.json"),
            Some("s3cret".to_string()),
        );
        (dir, store, verifier)
    }

    #[test]
    fn valid_approval_is_consumed_once() {
        let (_dir, store, verifier) = setup();
        issue(verifier.path(), "s3cret", "operator", 1).unwrap();

        let approver = verifier.verify_and_consume(&store, "publish.site").unwrap();
        assert_eq!(approver, "operator");

        // Same counter again: stale.
        let err = verifier
            .verify_and_consume(&store, "publish.site")
            .unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ApprovalRequired));
    }

    #[test]
    fn missing_file_and_bad_signature_are_rejected() {
        let (_dir, store, verifier) = setup();
        let err = verifier.verify_and_consume(&store, "x").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ApprovalRequired));

        issue(verifier.path(), "wrong-secret", "operator", 1).unwrap();
        let err = verifier.verify_and_consume(&store, "x").unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ApprovalRequired));
    }

    #[test]
    fn higher_counter_reopens_the_gate() {
        let (_dir, store, verifier) = setup();
        issue(verifier.path(), "s3cret", "operator", 1).unwrap();
        verifier.verify_and_consume(&store, "x").unwrap();

        issue(verifier.path(), "s3cret", "operator", 2).unwrap();
        assert!(verifier.verify_and_consume(&store, "x").is_ok());
    }
}
