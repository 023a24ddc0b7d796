//! Connector chain execution: smart routing, bounded retries with fallback
//! across the ranked candidates, circuit breaking, and replayable records.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::McpConfig;
use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::mcp::breaker::{Admission, CircuitBreakerMap, ToolBreaker};
use crate::mcp::retry::RetryPolicy;
use crate::mcp::router::{history_from_records, rank_tools};
use crate::mcp::stdio;
use crate::mcp::types::{InProcessTransport, ToolDescriptor, ToolHandler, ToolRequest, ToolResponse, ToolTransport};
use crate::store::StateStore;
use crate::types::{RunId, ToolCallRecord};

/// Replay records feed routing history over this many trailing days.
const HISTORY_WINDOW_DAYS: i64 = 7;

const BREAKER_STATE_FILE: &str = "breaker.json";

/// One chain request from a strategy or pipeline step.
#[derive(Debug, Clone)]
pub struct ChainRequest {
    /// Natural-language intent driving the router's tool match.
    pub intent: String,
    pub params: serde_json::Value,
    pub run_id: RunId,
    pub step_id: String,
    pub dry_run: bool,
    /// Disables retry jitter.
    pub deterministic: bool,
}

/// Terminal report of one chain execution.
#[derive(Debug)]
pub struct ChainOutcome {
    /// Tool that produced the terminal result, when any call was made.
    pub tool_id: Option<String>,
    pub retries: u32,
    pub fallbacks: u32,
    pub result: KernelResult<ToolResponse>,
}

pub struct McpRuntime {
    config: McpConfig,
    catalog: RwLock<Vec<ToolDescriptor>>,
    in_process: Arc<InProcessTransport>,
    breakers: CircuitBreakerMap,
    store: Arc<StateStore>,
}

impl std::fmt::Debug for McpRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools = self.catalog.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("McpRuntime").field("tools", &tools).finish()
    }
}

impl McpRuntime {
    /// Build the runtime and restore persisted breaker state, so a restart
    /// does not forget tripped tools.
    pub fn new(config: McpConfig, store: Arc<StateStore>) -> KernelResult<Self> {
        let breakers = CircuitBreakerMap::new(config.breaker.clone());
        if let Some(snapshot) = store
            .load_state_file::<std::collections::HashMap<String, ToolBreaker>>(BREAKER_STATE_FILE)?
        {
            breakers.load_snapshot(snapshot);
        }
        Ok(Self {
            config,
            catalog: RwLock::new(Vec::new()),
            in_process: Arc::new(InProcessTransport::new()),
            breakers,
            store,
        })
    }

    pub fn register_tool(&self, descriptor: ToolDescriptor) -> KernelResult<()> {
        let mut catalog = self
            .catalog
            .write()
            .map_err(|_| KernelError::Store("catalog lock poisoned".into()))?;
        catalog.retain(|t| t.id() != descriptor.id());
        catalog.push(descriptor);
        Ok(())
    }

    /// Register a tool backed by an in-process handler.
    pub fn register_in_process(
        &self,
        descriptor: ToolDescriptor,
        handler: ToolHandler,
    ) -> KernelResult<()> {
        self.in_process
            .register(&descriptor.server, &descriptor.tool, handler);
        self.register_tool(descriptor)
    }

    pub fn catalog(&self) -> KernelResult<Vec<ToolDescriptor>> {
        self.catalog
            .read()
            .map(|c| c.clone())
            .map_err(|_| KernelError::Store("catalog lock poisoned".into()))
    }

    pub fn breakers(&self) -> &CircuitBreakerMap {
        &self.breakers
    }

    fn persist_breakers(&self) {
        if let Err(e) = self
            .store
            .save_state_file(BREAKER_STATE_FILE, &self.breakers.snapshot())
        {
            warn!(error = %e, "failed to persist breaker state");
        }
    }

    async fn transport_call(
        &self,
        tool: &ToolDescriptor,
        request: &ToolRequest,
        budget: Duration,
    ) -> KernelResult<ToolResponse> {
        let call = async {
            match &tool.command {
                Some(command) => stdio::call_command(command, request).await,
                None => self.in_process.call(request).await,
            }
        };
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(KernelError::transient(
                ErrorKind::ToolTimeout,
                format!("tool {} exceeded its deadline", tool.id()),
            )),
        }
    }

    /// Execute one chain: rank candidates, retry transient failures per tool,
    /// fall back across tools, and stop at the whole-chain budget. Exactly
    /// one replayable record is appended per chain.
    pub async fn execute(&self, request: ChainRequest, cancel: Option<Arc<AtomicBool>>) -> ChainOutcome {
        let started = Instant::now();
        let started_at = Utc::now();
        let budget = Duration::from_secs(self.config.chain_deadline_secs);
        let retry_policy = RetryPolicy::from(&self.config.retry);

        let catalog = match self.catalog() {
            Ok(c) => c,
            Err(e) => {
                return ChainOutcome {
                    tool_id: None,
                    retries: 0,
                    fallbacks: 0,
                    result: Err(e),
                }
            }
        };
        let since = started_at - chrono::Duration::days(HISTORY_WINDOW_DAYS);
        let history = self
            .store
            .tool_calls_since(since)
            .map(|records| history_from_records(&records))
            .unwrap_or_default();
        let ranked = rank_tools(
            &catalog,
            &request.intent,
            &history,
            &self.breakers,
            &self.config,
            started_at,
        );

        if ranked.is_empty() {
            let result = Err(KernelError::attempt(
                ErrorKind::ServiceUnavailable,
                "no admissible tool for this intent",
            ));
            return self.finish_chain(&request, None, 0, 0, started, result);
        }

        let mut retries_total = 0u32;
        let mut fallbacks = 0u32;
        let mut best_partial: Option<(String, ToolResponse)> = None;
        let mut last_error: Option<KernelError> = None;

        'tools: for (tool_index, tool) in ranked.iter().enumerate() {
            if tool_index > 0 {
                fallbacks += 1;
            }
            if is_cancelled(&cancel) {
                return self.finish_chain(
                    &request,
                    Some(tool.id()),
                    retries_total,
                    fallbacks,
                    started,
                    Err(KernelError::Cancelled),
                );
            }

            match self.breakers.admission(&tool.id(), Utc::now()) {
                Admission::Deny { retry_after_secs } => {
                    debug!(tool = %tool.id(), retry_after_secs, "breaker open, skipping tool");
                    continue;
                }
                Admission::Allow | Admission::Probe => {}
            }

            let wire_request = ToolRequest {
                server: tool.server.clone(),
                tool: tool.tool.clone(),
                params: request.params.clone(),
                dry_run: request.dry_run,
            };

            for retry in 0..=self.config.retry.max_retries {
                if retry > 0 {
                    retries_total += 1;
                    let delay = retry_policy.delay_for_retry(retry, request.deterministic);
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        break 'tools;
                    }
                    tokio::time::sleep(delay.min(remaining)).await;
                    if is_cancelled(&cancel) {
                        return self.finish_chain(
                            &request,
                            Some(tool.id()),
                            retries_total,
                            fallbacks,
                            started,
                            Err(KernelError::Cancelled),
                        );
                    }
                }

                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    break 'tools;
                }

                match self.transport_call(tool, &wire_request, remaining).await {
                    Ok(response) => {
                        self.breakers.record_success(&tool.id());
                        self.persist_breakers();
                        if response.partial && tool_index + 1 < ranked.len() {
                            // Hold the partial and let a later candidate try
                            // for a complete result.
                            best_partial = Some((tool.id(), response));
                            continue 'tools;
                        }
                        return self.finish_chain(
                            &request,
                            Some(tool.id()),
                            retries_total,
                            fallbacks,
                            started,
                            Ok(response),
                        );
                    }
                    Err(error) => {
                        self.breakers.record_failure(&tool.id(), Utc::now());
                        self.persist_breakers();
                        let retryable = error.is_retryable();
                        debug!(tool = %tool.id(), retry, %error, "tool call failed");
                        last_error = Some(error);
                        if !retryable {
                            continue 'tools;
                        }
                    }
                }
            }
        }

        // Budget exhausted or every candidate failed: best partial wins over
        // a definitive failure.
        if let Some((tool_id, response)) = best_partial {
            return self.finish_chain(
                &request,
                Some(tool_id),
                retries_total,
                fallbacks,
                started,
                Ok(response),
            );
        }
        let result = Err(last_error.unwrap_or_else(|| {
            KernelError::attempt(ErrorKind::ToolTimeout, "chain budget exhausted")
        }));
        self.finish_chain(&request, None, retries_total, fallbacks, started, result)
    }

    fn finish_chain(
        &self,
        request: &ChainRequest,
        tool_id: Option<String>,
        retries: u32,
        fallbacks: u32,
        started: Instant,
        result: KernelResult<ToolResponse>,
    ) -> ChainOutcome {
        let (server, tool) = match &tool_id {
            Some(id) => {
                let mut parts = id.splitn(2, '/');
                (
                    parts.next().unwrap_or_default().to_string(),
                    parts.next().unwrap_or_default().to_string(),
                )
            }
            None => (String::new(), String::new()),
        };
        let record = ToolCallRecord {
            run_id: request.run_id.clone(),
            step_id: request.step_id.clone(),
            server,
            tool,
            params: request.params.clone(),
            dry_run: request.dry_run,
            succeeded: result.is_ok(),
            error_kind: result.as_ref().err().and_then(|e| e.error_kind()),
            latency_ms: started.elapsed().as_millis() as u64,
            ts: Utc::now(),
        };
        if let Err(e) = self.store.record_tool_call(&record) {
            warn!(error = %e, "failed to record tool call");
        }

        ChainOutcome {
            tool_id,
            retries,
            fallbacks,
            result,
        }
    }

    /// Re-execute a recorded chain step. With `dry_run` the tool is not
    /// invoked; the bound request is echoed back instead.
    pub async fn replay(
        &self,
        run_id: &str,
        step_id: &str,
        dry_run: bool,
    ) -> KernelResult<ChainOutcome> {
        let record = self
            .store
            .find_tool_call(run_id, step_id)?
            .ok_or_else(|| {
                KernelError::Store(format!("no replay record for {}.{}", run_id, step_id))
            })?;

        if dry_run {
            return Ok(ChainOutcome {
                tool_id: Some(format!("{}/{}", record.server, record.tool)),
                retries: 0,
                fallbacks: 0,
                result: Ok(ToolResponse {
                    value: serde_json::json!({
                        "dry_run": true,
                        "server": record.server,
                        "tool": record.tool,
                        "params": record.params,
                    }),
                    artifacts: vec![],
                    partial: false,
                }),
            });
        }

        // Direct re-invocation of the recorded tool, no re-ranking.
        let descriptor = self
            .catalog()?
            .into_iter()
            .find(|t| t.server == record.server && t.tool == record.tool)
            .ok_or_else(|| {
                KernelError::Store(format!(
                    "tool {}/{} from replay record is no longer in the catalog",
                    record.server, record.tool
                ))
            })?;

        let started = Instant::now();
        let wire_request = ToolRequest {
            server: descriptor.server.clone(),
            tool: descriptor.tool.clone(),
            params: record.params.clone(),
            dry_run: false,
        };
        let budget = Duration::from_secs(self.config.chain_deadline_secs);
        let result = self.transport_call(&descriptor, &wire_request, budget).await;
        match &result {
            Ok(_) => self.breakers.record_success(&descriptor.id()),
            Err(_) => self.breakers.record_failure(&descriptor.id(), Utc::now()),
        }
        self.persist_breakers();

        let replay_request = ChainRequest {
            intent: String::new(),
            params: record.params.clone(),
            run_id: record.run_id.clone(),
            step_id: format!("{}.replay", record.step_id),
            dry_run: false,
            deterministic: true,
        };
        Ok(self.finish_chain(
            &replay_request,
            Some(descriptor.id()),
            0,
            0,
            started,
            result,
        ))
    }
}

fn is_cancelled(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{McpConfig, RetryConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn runtime_with(config: McpConfig) -> (tempfile::TempDir, Arc<McpRuntime>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        let runtime = Arc::new(McpRuntime::new(config, store).unwrap());
        (dir, runtime)
    }

    fn tool(server: &str, name: &str, keywords: &[&str]) -> ToolDescriptor {
        ToolDescriptor {
            server: server.into(),
            tool: name.into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            cost: 0.1,
            command: None,
        }
    }

    fn fast_retry_config() -> McpConfig {
        McpConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                backoff_factor: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn chain(intent: &str) -> ChainRequest {
        ChainRequest {
            intent: intent.into(),
            params: json!({"url": "http://example.com"}),
            run_id: "run-1".into(),
            step_id: "step-0".into(),
            dry_run: false,
            deterministic: true,
        }
    }

    #[tokio::test]
    async fn falls_back_to_second_tool_after_retries() {
        let (_dir, runtime) = runtime_with(fast_retry_config());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        runtime
            .register_in_process(
                tool("web", "fetch", &["fetch", "url"]),
                Arc::new(move |_req| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        Err(KernelError::transient(
                            ErrorKind::ToolTimeout,
                            "simulated timeout",
                        ))
                    })
                }),
            )
            .unwrap();
        runtime
            .register_in_process(
                tool("web", "search", &["fetch"]),
                Arc::new(|_req| {
                    Box::pin(async {
                        Ok(ToolResponse {
                            value: json!({"summary": "ok"}),
                            artifacts: vec![],
                            partial: false,
                        })
                    })
                }),
            )
            .unwrap();

        let outcome = runtime.execute(chain("fetch url and summarize"), None).await;
        let response = outcome.result.unwrap();
        assert_eq!(response.value["summary"], "ok");
        assert_eq!(outcome.tool_id.as_deref(), Some("web/search"));
        // Primary tool: initial call + 2 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.fallbacks, 1);
    }

    #[tokio::test]
    async fn breaker_trips_after_consecutive_chain_failures() {
        let mut config = fast_retry_config();
        config.retry.max_retries = 0;
        let (_dir, runtime) = runtime_with(config);

        runtime
            .register_in_process(
                tool("web", "fetch", &["fetch"]),
                Arc::new(|_req| {
                    Box::pin(async {
                        Err(KernelError::transient(
                            ErrorKind::ServiceUnavailable,
                            "down",
                        ))
                    })
                }),
            )
            .unwrap();

        for _ in 0..3 {
            let outcome = runtime.execute(chain("fetch"), None).await;
            assert!(outcome.result.is_err());
        }
        assert_eq!(
            runtime.breakers().state_of("web/fetch"),
            crate::mcp::breaker::BreakerState::Open
        );

        // With the only tool tripped the chain has no admissible candidate.
        let outcome = runtime.execute(chain("fetch"), None).await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::ServiceUnavailable));
    }

    #[tokio::test]
    async fn breaker_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_at(dir.path(), false).unwrap());
        {
            let mut config = fast_retry_config();
            config.retry.max_retries = 0;
            let runtime = McpRuntime::new(config, Arc::clone(&store)).unwrap();
            runtime
                .register_in_process(
                    tool("web", "fetch", &["fetch"]),
                    Arc::new(|_req| {
                        Box::pin(async {
                            Err(KernelError::transient(
                                ErrorKind::ServiceUnavailable,
                                "down",
                            ))
                        })
                    }),
                )
                .unwrap();
            for _ in 0..3 {
                let _ = runtime.execute(chain("fetch"), None).await;
            }
        }

        let runtime = McpRuntime::new(fast_retry_config(), store).unwrap();
        assert_eq!(
            runtime.breakers().state_of("web/fetch"),
            crate::mcp::breaker::BreakerState::Open
        );
    }

    #[tokio::test]
    async fn chains_are_replayable() {
        let (_dir, runtime) = runtime_with(fast_retry_config());
        runtime
            .register_in_process(
                tool("web", "search", &["find"]),
                Arc::new(|req| {
                    Box::pin(async move {
                        Ok(ToolResponse {
                            value: json!({"echo": req.params}),
                            artifacts: vec![],
                            partial: false,
                        })
                    })
                }),
            )
            .unwrap();

        let outcome = runtime.execute(chain("find things"), None).await;
        assert!(outcome.result.is_ok());

        let replayed = runtime.replay("run-1", "step-0", true).await.unwrap();
        let value = replayed.result.unwrap().value;
        assert_eq!(value["dry_run"], true);
        assert_eq!(value["tool"], "search");

        let rerun = runtime.replay("run-1", "step-0", false).await.unwrap();
        assert!(rerun.result.unwrap().value["echo"]["url"].is_string());
    }

    #[tokio::test]
    async fn cancellation_stops_the_chain() {
        let (_dir, runtime) = runtime_with(fast_retry_config());
        runtime
            .register_in_process(
                tool("web", "fetch", &["fetch"]),
                Arc::new(|_req| {
                    Box::pin(async {
                        Err(KernelError::transient(
                            ErrorKind::ServiceUnavailable,
                            "down",
                        ))
                    })
                }),
            )
            .unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let outcome = runtime.execute(chain("fetch"), Some(cancel)).await;
        assert!(matches!(outcome.result, Err(KernelError::Cancelled)));
    }
}
