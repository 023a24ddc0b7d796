//! Per-tool circuit breaker.
//!
//! States: `closed` -> `open` after `failure_threshold` consecutive failures
//! within the window, `open` -> `half-open` after the cooldown, `half-open`
//! admits exactly one probe whose outcome decides between `closed` and a
//! fresh `open`. The whole map serializes to a state file so restarts do not
//! forget tripped tools; wall-clock timestamps are used for that reason.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBreaker {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_in_flight: bool,
}

impl Default for ToolBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Admission decision for one prospective tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// The single half-open probe.
    Probe,
    Deny { retry_after_secs: i64 },
}

#[derive(Debug)]
pub struct CircuitBreakerMap {
    tools: DashMap<String, ToolBreaker>,
    config: BreakerConfig,
}

impl CircuitBreakerMap {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            tools: DashMap::new(),
            config,
        }
    }

    /// Decide whether a call to `tool_id` may proceed at `now`.
    ///
    /// Open breakers transition to half-open in place once the cooldown has
    /// elapsed; the first caller after that transition gets the probe slot.
    pub fn admission(&self, tool_id: &str, now: DateTime<Utc>) -> Admission {
        let mut entry = self.tools.entry(tool_id.to_string()).or_default();
        match entry.state {
            BreakerState::Closed => Admission::Allow,
            BreakerState::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                let reopen_at = opened_at + ChronoDuration::seconds(self.config.cooldown_secs as i64);
                if now >= reopen_at {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Deny {
                        retry_after_secs: (reopen_at - now).num_seconds().max(0),
                    }
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    Admission::Deny {
                        retry_after_secs: 1,
                    }
                } else {
                    entry.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Read-only admission check for routing. Never transitions state or
    /// consumes the half-open probe slot; the mutating [`Self::admission`]
    /// runs at call time.
    pub fn peek_admission(&self, tool_id: &str, now: DateTime<Utc>) -> Admission {
        match self.tools.get(tool_id) {
            None => Admission::Allow,
            Some(entry) => match entry.state {
                BreakerState::Closed => Admission::Allow,
                BreakerState::Open => {
                    let opened_at = entry.opened_at.unwrap_or(now);
                    let reopen_at =
                        opened_at + ChronoDuration::seconds(self.config.cooldown_secs as i64);
                    if now >= reopen_at {
                        Admission::Probe
                    } else {
                        Admission::Deny {
                            retry_after_secs: (reopen_at - now).num_seconds().max(0),
                        }
                    }
                }
                BreakerState::HalfOpen => {
                    if entry.probe_in_flight {
                        Admission::Deny {
                            retry_after_secs: 1,
                        }
                    } else {
                        Admission::Probe
                    }
                }
            },
        }
    }

    pub fn record_success(&self, tool_id: &str) {
        let mut entry = self.tools.entry(tool_id.to_string()).or_default();
        *entry = ToolBreaker::default();
    }

    pub fn record_failure(&self, tool_id: &str, now: DateTime<Utc>) {
        let mut entry = self.tools.entry(tool_id.to_string()).or_default();

        if entry.state == BreakerState::HalfOpen {
            // Probe failed: back to open with a fresh cooldown.
            entry.state = BreakerState::Open;
            entry.opened_at = Some(now);
            entry.probe_in_flight = false;
            entry.consecutive_failures += 1;
            return;
        }

        // Consecutive-failure window: restart the count when the previous
        // streak started outside the window.
        let window = ChronoDuration::seconds(self.config.window_secs as i64);
        match entry.first_failure_at {
            Some(first) if now - first <= window => {
                entry.consecutive_failures += 1;
            }
            _ => {
                entry.consecutive_failures = 1;
                entry.first_failure_at = Some(now);
            }
        }

        if entry.consecutive_failures >= self.config.failure_threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(now);
        }
    }

    /// Deadline at which an open breaker becomes eligible for its half-open
    /// probe. `None` for closed and half-open breakers.
    pub fn cooldown_until(&self, breaker: &ToolBreaker) -> Option<DateTime<Utc>> {
        match breaker.state {
            BreakerState::Open => breaker
                .opened_at
                .map(|t| t + ChronoDuration::seconds(self.config.cooldown_secs as i64)),
            _ => None,
        }
    }

    pub fn state_of(&self, tool_id: &str) -> BreakerState {
        self.tools
            .get(tool_id)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Serializable view for persistence and dashboards.
    pub fn snapshot(&self) -> HashMap<String, ToolBreaker> {
        self.tools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn load_snapshot(&self, snapshot: HashMap<String, ToolBreaker>) {
        self.tools.clear();
        for (tool_id, mut breaker) in snapshot {
            // An in-flight probe cannot survive a restart.
            if breaker.state == BreakerState::HalfOpen {
                breaker.probe_in_flight = false;
            }
            self.tools.insert(tool_id, breaker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> CircuitBreakerMap {
        CircuitBreakerMap::new(BreakerConfig {
            failure_threshold: 3,
            window_secs: 600,
            cooldown_secs: 300,
        })
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let breakers = map();
        let now = Utc::now();
        for _ in 0..2 {
            breakers.record_failure("web/fetch", now);
            assert_eq!(breakers.state_of("web/fetch"), BreakerState::Closed);
        }
        breakers.record_failure("web/fetch", now);
        assert_eq!(breakers.state_of("web/fetch"), BreakerState::Open);
        assert!(matches!(
            breakers.admission("web/fetch", now),
            Admission::Deny { .. }
        ));
    }

    #[test]
    fn failures_outside_window_restart_the_streak() {
        let breakers = map();
        let t0 = Utc::now();
        breakers.record_failure("t", t0);
        breakers.record_failure("t", t0 + ChronoDuration::seconds(10));
        // Third failure lands outside the 600s window of the first.
        breakers.record_failure("t", t0 + ChronoDuration::seconds(700));
        assert_eq!(breakers.state_of("t"), BreakerState::Closed);
    }

    #[test]
    fn cooldown_admits_exactly_one_probe() {
        let breakers = map();
        let t0 = Utc::now();
        for _ in 0..3 {
            breakers.record_failure("t", t0);
        }
        let after_cooldown = t0 + ChronoDuration::seconds(301);
        assert_eq!(breakers.admission("t", after_cooldown), Admission::Probe);
        // Second caller while the probe is in flight is denied.
        assert!(matches!(
            breakers.admission("t", after_cooldown),
            Admission::Deny { .. }
        ));
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let breakers = map();
        let t0 = Utc::now();
        for _ in 0..3 {
            breakers.record_failure("t", t0);
        }
        let later = t0 + ChronoDuration::seconds(301);
        assert_eq!(breakers.admission("t", later), Admission::Probe);
        breakers.record_success("t");
        assert_eq!(breakers.state_of("t"), BreakerState::Closed);

        for _ in 0..3 {
            breakers.record_failure("t", later);
        }
        let retry = later + ChronoDuration::seconds(301);
        assert_eq!(breakers.admission("t", retry), Admission::Probe);
        breakers.record_failure("t", retry);
        assert_eq!(breakers.state_of("t"), BreakerState::Open);
        // Fresh cooldown: still denied right after the failed probe.
        assert!(matches!(
            breakers.admission("t", retry + ChronoDuration::seconds(10)),
            Admission::Deny { .. }
        ));
    }

    #[test]
    fn cooldown_deadline_tracks_opened_at() {
        let breakers = map();
        let t0 = Utc::now();
        for _ in 0..3 {
            breakers.record_failure("t", t0);
        }
        let entry = breakers.snapshot().remove("t").unwrap();
        let until = breakers.cooldown_until(&entry).unwrap();
        assert_eq!(until, entry.opened_at.unwrap() + ChronoDuration::seconds(300));

        // Closed breakers have no deadline.
        breakers.record_success("t");
        let entry = breakers.snapshot().remove("t").unwrap();
        assert_eq!(breakers.cooldown_until(&entry), None);
    }

    #[test]
    fn snapshot_round_trips_and_clears_probe_flag() {
        let breakers = map();
        let t0 = Utc::now();
        for _ in 0..3 {
            breakers.record_failure("t", t0);
        }
        breakers.admission("t", t0 + ChronoDuration::seconds(301));

        let restored = map();
        restored.load_snapshot(breakers.snapshot());
        assert_eq!(restored.state_of("t"), BreakerState::HalfOpen);
        // The restored map hands out a fresh probe slot.
        assert_eq!(
            restored.admission("t", t0 + ChronoDuration::seconds(302)),
            Admission::Probe
        );
    }
}
