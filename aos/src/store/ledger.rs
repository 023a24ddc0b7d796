//! Append-only JSON Lines event logs with a SHA-256 hash chain.
//!
//! Each log is a single UTF-8 file, one event per LF-terminated line. A line
//! is an [`EventEnvelope`]: schema version, monotonic sequence number,
//! timestamp, chain hash and the typed event payload. The chain hash of line
//! N is `sha256(chain_hash[N-1] || body[N])`, so any in-place edit or
//! reordering of history is detectable by [`EventLog::verify_integrity`].
//!
//! Concurrency model: single writer per log (serialized through a mutex),
//! any number of readers. Readers re-open the file and therefore observe a
//! snapshot-consistent prefix.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{KernelError, KernelResult};

/// Version stamped on every persisted line.
pub const SCHEMA_VERSION: u32 = 1;

/// One persisted line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub schema_version: u32,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub chain_hash: String,
    pub event: T,
}

struct LogWriter {
    file: File,
    next_seq: u64,
    last_hash: Option<String>,
}

/// A typed append-only log backed by one JSONL file.
pub struct EventLog<T> {
    path: PathBuf,
    fsync: bool,
    writer: Mutex<LogWriter>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> std::fmt::Debug for EventLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("path", &self.path).finish()
    }
}

fn chain_body(seq: u64, ts: &DateTime<Utc>, event_json: &str) -> String {
    format!("{}|{}|{}", seq, ts.to_rfc3339(), event_json)
}

fn next_chain_hash(prev: Option<&str>, body: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev.as_bytes());
    }
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl<T: Serialize + DeserializeOwned> EventLog<T> {
    /// Open (or create) the log at `path`, recovering the sequence counter
    /// and the chain tip from the existing tail.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> KernelResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (next_seq, last_hash) = Self::recover_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            fsync,
            writer: Mutex::new(LogWriter {
                file,
                next_seq,
                last_hash,
            }),
            _marker: PhantomData,
        })
    }

    fn recover_tail(path: &Path) -> KernelResult<(u64, Option<String>)> {
        if !path.exists() {
            return Ok((0, None));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut next_seq = 0u64;
        let mut last_hash = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Only the envelope header is needed here; payload stays opaque.
            let header: EnvelopeHeader = serde_json::from_str(&line).map_err(|e| {
                KernelError::Store(format!("corrupt event log {}: {}", path.display(), e))
            })?;
            next_seq = header.seq + 1;
            last_hash = Some(header.chain_hash);
        }
        Ok((next_seq, last_hash))
    }

    /// Append one event. Persisted (and optionally fsynced) before returning,
    /// so a caller that observes `Ok` can rely on the event surviving a crash.
    pub fn append(&self, event: &T) -> KernelResult<u64> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| KernelError::Store("event log writer poisoned".into()))?;

        let ts = Utc::now();
        let seq = writer.next_seq;
        // Hash over the normalized JSON value so append and verify agree on
        // key ordering regardless of the payload struct's field order.
        let event_value = serde_json::to_value(event)?;
        let event_json = serde_json::to_string(&event_value)?;
        let chain_hash = next_chain_hash(
            writer.last_hash.as_deref(),
            &chain_body(seq, &ts, &event_json),
        );

        let envelope = EventEnvelope {
            schema_version: SCHEMA_VERSION,
            seq,
            ts,
            chain_hash: chain_hash.clone(),
            event: event_value,
        };
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        writer.file.write_all(line.as_bytes())?;
        if self.fsync {
            writer.file.sync_data()?;
        }

        writer.next_seq = seq + 1;
        writer.last_hash = Some(chain_hash);
        Ok(seq)
    }

    /// Read every event in insertion order.
    pub fn read_all(&self) -> KernelResult<Vec<EventEnvelope<T>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let envelope: EventEnvelope<T> = serde_json::from_str(&line).map_err(|e| {
                KernelError::Store(format!("corrupt event log {}: {}", self.path.display(), e))
            })?;
            out.push(envelope);
        }
        Ok(out)
    }

    /// Re-derive the chain over the whole file. Returns the sequence number
    /// of the first divergent line, or `None` when the chain is intact.
    pub fn verify_integrity(&self) -> KernelResult<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut prev: Option<String> = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let raw: EventEnvelope<serde_json::Value> =
                serde_json::from_str(&line).map_err(|e| {
                    KernelError::Store(format!(
                        "corrupt event log {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
            let event_json = serde_json::to_string(&raw.event)?;
            let expected = next_chain_hash(
                prev.as_deref(),
                &chain_body(raw.seq, &raw.ts, &event_json),
            );
            if expected != raw.chain_hash {
                return Ok(Some(raw.seq));
            }
            prev = Some(raw.chain_hash);
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    seq: u64,
    chain_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        label: String,
    }

    fn tmp_log() -> (tempfile::TempDir, EventLog<Ping>) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("pings.jsonl"), true).unwrap();
        (dir, log)
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let (_dir, log) = tmp_log();
        for n in 0..5 {
            let seq = log
                .append(&Ping {
                    n,
                    label: "x".into(),
                })
                .unwrap();
            assert_eq!(seq, n as u64);
        }
        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].event.n, 4);
        assert_eq!(events[4].schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn reopen_recovers_seq_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pings.jsonl");
        {
            let log: EventLog<Ping> = EventLog::open(&path, true).unwrap();
            log.append(&Ping {
                n: 1,
                label: "a".into(),
            })
            .unwrap();
        }
        let log: EventLog<Ping> = EventLog::open(&path, true).unwrap();
        let seq = log
            .append(&Ping {
                n: 2,
                label: "b".into(),
            })
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(log.verify_integrity().unwrap(), None);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pings.jsonl");
        let log: EventLog<Ping> = EventLog::open(&path, true).unwrap();
        for n in 0..3 {
            log.append(&Ping {
                n,
                label: "x".into(),
            })
            .unwrap();
        }
        drop(log);

        // Flip a payload field on the middle line without recomputing hashes.
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered: String = content
            .lines()
            .map(|l| {
                if l.contains("\"n\":1") {
                    l.replace("\"n\":1", "\"n\":99")
                } else {
                    l.to_string()
                }
            })
            .map(|l| l + "\n")
            .collect();
        std::fs::write(&path, tampered).unwrap();

        let log: EventLog<Ping> = EventLog::open(&path, true).unwrap();
        assert_eq!(log.verify_integrity().unwrap(), Some(1));
    }
}
