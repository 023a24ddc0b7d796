//! Kernel facade: wires the store, registry, governance, connector runtime,
//! ranker and engine together, and fronts the worker pool with
//! `submit` / `status` / `wait` / `cancel`.

pub mod classifier;
pub mod planner;

pub use planner::Planner;

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::info;

use crate::config::AosConfig;
use crate::engine::queue::{RunJob, WorkerPool};
use crate::engine::Engine;
use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::governance::GovernanceKernel;
use crate::mcp::{McpRuntime, ToolDescriptor};
use crate::ranker::Ranker;
use crate::registry::{builtins, ServiceRegistry};
use crate::store::StateStore;
use crate::types::{
    DeliveryBundle, ExecutionPlan, Origin, Profile, RunContext, RunId, RunOutcome, RunStatus,
    RunSummary, TaskKind, TaskSpec,
};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub text: String,
    pub profile: Option<Profile>,
    pub origin: Origin,
    pub params: IndexMap<String, serde_json::Value>,
    /// Skip classification when the operator pinned the kind.
    pub kind: Option<TaskKind>,
}

impl SubmitRequest {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            profile: None,
            origin: Origin::Cli,
            params: IndexMap::new(),
            kind: None,
        }
    }
}

struct RunHandle {
    cancel: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
    receiver: Mutex<Option<oneshot::Receiver<KernelResult<RunSummary>>>>,
}

pub struct Kernel {
    config: Arc<AosConfig>,
    store: Arc<StateStore>,
    registry: Arc<ServiceRegistry>,
    governance: Arc<GovernanceKernel>,
    mcp: Arc<McpRuntime>,
    engine: Arc<Engine>,
    planner: Planner,
    pool: WorkerPool,
    inflight: DashMap<RunId, RunHandle>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl Kernel {
    /// Open the store, build every component, register the built-in pack and
    /// the configured tool catalog, and start the worker pool. Strict
    /// contract lint failures surface here and fail process start.
    pub fn bootstrap(config: AosConfig) -> KernelResult<Self> {
        let config = Arc::new(config);
        let store = Arc::new(StateStore::open(&config.store)?);
        let registry = Arc::new(ServiceRegistry::new(config.governance.strict_contract_lint));
        let governance = Arc::new(GovernanceKernel::new(
            config.governance.clone(),
            Arc::clone(&store),
        )?);
        let mcp = Arc::new(McpRuntime::new(config.mcp.clone(), Arc::clone(&store))?);

        builtins::register_builtins(&registry, &store, &mcp)?;
        for entry in &config.tools {
            mcp.register_tool(ToolDescriptor {
                server: entry.server.clone(),
                tool: entry.tool.clone(),
                keywords: entry.keywords.clone(),
                cost: entry.cost,
                command: entry.command.clone(),
            })?;
        }

        let ranker = Arc::new(Ranker::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&governance),
            Arc::clone(&store),
        ));
        let engine = Arc::new(Engine::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&governance),
            Arc::clone(&ranker),
        ));
        let pool = WorkerPool::start(
            Arc::clone(&engine),
            config.engine.effective_worker_pool(),
            config.engine.queue_capacity,
        );
        let planner = Planner::new(Arc::clone(&config), Arc::clone(&store));

        info!(
            workers = config.engine.effective_worker_pool(),
            queue = config.engine.queue_capacity,
            "kernel bootstrapped"
        );
        Ok(Self {
            config,
            store,
            registry,
            governance,
            mcp,
            engine,
            planner,
            pool,
            inflight: DashMap::new(),
        })
    }

    /// Accept a task: classify, bind the profile and governance envelope,
    /// record the ingress, and enqueue for execution. A full queue rejects
    /// the submission with `backpressure` and seals the run accordingly.
    pub fn submit(&self, request: SubmitRequest) -> KernelResult<RunId> {
        let task = self.planner.build_task(
            &request.text,
            request.origin,
            request.params,
            request.kind,
        );
        let profile = self
            .planner
            .resolve_profile(request.profile, task.task_kind)?;
        let ctx = self.planner.bind_context(&task, profile)?;
        let run_id = ctx.run_id.clone();

        self.store.record_submitted(&task, &ctx)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let job = RunJob {
            task: task.clone(),
            ctx: ctx.clone(),
            cancel: Arc::clone(&cancel),
            started: Arc::clone(&started),
            done: done_tx,
        };

        if let Err(error) = self.pool.try_submit(job) {
            // The ingress is already on the ledger; seal it so the run does
            // not dangle as pending forever.
            let summary = RunSummary {
                run_id: run_id.clone(),
                task_id: task.task_id.clone(),
                outcome: RunOutcome::Failed,
                chosen_strategy: None,
                attempts_count: 0,
                total_latency_ms: 0,
                delivery_bundle_ref: None,
                last_error: Some(ErrorKind::Backpressure),
                sealed_at: Utc::now(),
            };
            let bundle = DeliveryBundle {
                run_id: run_id.clone(),
                headline: "The runtime is at capacity; this task was not accepted.".into(),
                clarification_questions: vec![],
                assumptions: vec![],
                primary_artifact: None,
                supporting_artifacts: vec![],
                why_failed: Some(format!("{}: {}", ErrorKind::Backpressure.as_str(), error)),
                retry_options: vec![],
            };
            self.store.seal_run(summary, &bundle, &[])?;
            return Err(error);
        }

        self.inflight.insert(
            run_id.clone(),
            RunHandle {
                cancel,
                started,
                receiver: Mutex::new(Some(done_rx)),
            },
        );
        Ok(run_id)
    }

    /// Block until the run seals and return its summary.
    pub async fn wait(&self, run_id: &str) -> KernelResult<RunSummary> {
        let receiver = {
            let handle = self
                .inflight
                .get(run_id)
                .ok_or_else(|| KernelError::UnknownRun(run_id.to_string()))?;
            let mut slot = handle
                .receiver
                .lock()
                .map_err(|_| KernelError::Store("run handle poisoned".into()))?;
            slot.take()
        };
        let receiver = receiver
            .ok_or_else(|| KernelError::Store(format!("run '{}' is already awaited", run_id)))?;

        let result = receiver
            .await
            .map_err(|_| KernelError::Store("worker dropped the run".into()))?;
        self.inflight.remove(run_id);
        result
    }

    pub fn status(&self, run_id: &str) -> KernelResult<RunStatus> {
        if let Some((summary, _)) = self.store.sealed_summary(run_id)? {
            return Ok(RunStatus::Sealed { summary });
        }
        if let Some(handle) = self.inflight.get(run_id) {
            return Ok(if handle.started.load(Ordering::Relaxed) {
                RunStatus::Running
            } else {
                RunStatus::Pending
            });
        }
        if self.store.index().run(run_id)?.is_some() {
            return Ok(RunStatus::Pending);
        }
        Err(KernelError::UnknownRun(run_id.to_string()))
    }

    /// Cooperative cancellation; the engine checks before each attempt and
    /// between retries.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.inflight.get(run_id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Plan preview for dry-run submissions: everything up to execution.
    pub fn plan_preview(
        &self,
        request: &SubmitRequest,
    ) -> KernelResult<(TaskSpec, RunContext, ExecutionPlan)> {
        let task = self.planner.build_task(
            &request.text,
            request.origin,
            request.params.clone(),
            request.kind,
        );
        let profile = self
            .planner
            .resolve_profile(request.profile, task.task_kind)?;
        let ctx = self.planner.bind_context(&task, profile)?;
        let plan = self.engine.plan(&ctx, &task)?;
        Ok((task, ctx, plan))
    }

    pub fn config(&self) -> &AosConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn governance(&self) -> &Arc<GovernanceKernel> {
        &self.governance
    }

    pub fn mcp(&self) -> &Arc<McpRuntime> {
        &self.mcp
    }
}
