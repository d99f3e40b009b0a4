use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::retry::RetryOutcome;
use crate::{
    ConfigError, Credentials, GraphError, NodeRecord, OperatorContext, OperatorError,
    RetryExecutor, RetryPolicy, RunStateStore, SchedulerConfig, TaskGraph, TaskNode, TaskState,
};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Initialized,
    Validating,
    Executing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<OperatorError>,
}

/// Final, immutable report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub graph_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, NodeOutcome>,
    pub overall: RunStatus,
    /// Set when validation aborted the run before anything executed.
    pub validation_error: Option<GraphError>,
    pub cancelled: bool,
    /// Executed nodes in the order they reached a terminal state.
    pub completion_order: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.overall == RunStatus::Succeeded
    }

    pub fn state(&self, node_id: &str) -> Option<TaskState> {
        self.outcomes.get(node_id).map(|o| o.state)
    }

    pub fn states(&self) -> BTreeMap<String, TaskState> {
        self.outcomes
            .iter()
            .map(|(id, o)| (id.clone(), o.state))
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &NodeOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.state == TaskState::Failed)
            .map(|(id, o)| (id.as_str(), o))
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.state == TaskState::Skipped)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Human-readable diagnosis: which nodes failed, why, and what was
    /// skipped as a consequence.
    pub fn summary(&self) -> String {
        let status = match self.overall {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        let mut out = format!("run {} of {}: {status}\n", self.run_id, self.graph_id);

        if let Some(err) = &self.validation_error {
            let _ = writeln!(out, "  validation: {err}");
        }
        if self.cancelled {
            let _ = writeln!(out, "  cancelled before completion");
        }
        for (id, outcome) in self.failed() {
            match &outcome.error {
                Some(err) => {
                    let _ = writeln!(
                        out,
                        "  failed: {id} [{}] after {} attempt(s): {err}",
                        err.kind(),
                        outcome.attempts
                    );
                }
                None => {
                    let _ = writeln!(out, "  failed: {id}");
                }
            }
        }
        let skipped = self.skipped();
        if !skipped.is_empty() {
            let _ = writeln!(out, "  skipped: {}", skipped.join(", "));
        }
        out
    }
}

struct Completion {
    node_id: String,
    outcome: RetryOutcome<()>,
}

/// Per-node bookkeeping accumulated while a run executes.
#[derive(Default)]
struct RunLedger {
    attempts: HashMap<String, u32>,
    errors: HashMap<String, OperatorError>,
    completion_order: Vec<String>,
}

impl RunLedger {
    fn record(&mut self, node_id: &str, attempts: u32) {
        self.attempts.insert(node_id.to_string(), attempts);
        self.completion_order.push(node_id.to_string());
    }
}

/// Runs a [`TaskGraph`] to completion on a bounded worker pool.
pub struct Scheduler {
    config: SchedulerConfig,
    state_store: Option<Arc<dyn RunStateStore>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            state_store: None,
        }
    }
}

impl Scheduler {
    /// Fails if `config` does not pass [`SchedulerConfig::validate`].
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state_store: None,
        })
    }

    /// Persists a record per node after every terminal transition.
    pub fn with_state_store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validates and executes `graph`.
    ///
    /// Never returns an error: validation problems, operator failures and
    /// panics are all reported through the returned [`RunResult`]. Node
    /// states on `graph` are reset at the start and reflect the run after.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        credentials: Credentials,
        ctx: CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let graph_id = graph.graph_id().to_string();
        let mut phase = RunPhase::Initialized;
        let mut ledger = RunLedger::default();

        graph.reset_states();
        self.enter(&mut phase, RunPhase::Validating, run_id, &graph_id);

        if let Err(err) = graph.validate() {
            error!(
                %run_id,
                graph = %graph_id,
                error = %err,
                "graph validation failed, aborting run"
            );
            let ids: Vec<String> = graph.nodes().map(|n| n.id().to_string()).collect();
            for id in ids {
                graph.set_state(&id, TaskState::Skipped);
            }
            self.enter(&mut phase, RunPhase::Completed, run_id, &graph_id);
            return Self::finish(graph, run_id, started_at, Some(err), false, ledger);
        }

        self.enter(&mut phase, RunPhase::Executing, run_id, &graph_id);

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        loop {
            if !cancelled {
                for id in graph.ready_nodes(&graph.snapshot()) {
                    let Some(node) = graph.node(&id) else { continue };
                    self.spawn_node(
                        node,
                        run_id,
                        credentials.clone(),
                        ctx.clone(),
                        semaphore.clone(),
                        completion_tx.clone(),
                    );
                    graph.set_state(&id, TaskState::Running);
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(done) = completion_rx.recv() => {
                    in_flight -= 1;
                    let Completion { node_id, outcome } = done;

                    match outcome.result {
                        // cancelled while still waiting for a worker
                        Err(OperatorError::Cancelled) if outcome.attempts == 0 => {
                            info!(
                                %run_id,
                                node = %node_id,
                                "skipping task, run cancelled before it started"
                            );
                            graph.set_state(&node_id, TaskState::Skipped);
                            self.persist(&graph_id, run_id, &node_id, TaskState::Skipped, 0, None)
                                .await;
                        }
                        Ok(()) => {
                            info!(
                                %run_id,
                                node = %node_id,
                                attempts = outcome.attempts,
                                "task succeeded"
                            );
                            ledger.record(&node_id, outcome.attempts);
                            graph.set_state(&node_id, TaskState::Succeeded);
                            self.persist(
                                &graph_id,
                                run_id,
                                &node_id,
                                TaskState::Succeeded,
                                outcome.attempts,
                                None,
                            )
                            .await;
                        }
                        Err(err) => {
                            error!(
                                %run_id,
                                node = %node_id,
                                attempts = outcome.attempts,
                                kind = err.kind(),
                                error = %err,
                                "task failed"
                            );
                            ledger.record(&node_id, outcome.attempts);
                            graph.set_state(&node_id, TaskState::Failed);
                            self.persist(
                                &graph_id,
                                run_id,
                                &node_id,
                                TaskState::Failed,
                                outcome.attempts,
                                Some(err.clone()),
                            )
                            .await;
                            ledger.errors.insert(node_id.clone(), err);
                            self.skip_downstream(graph, &graph_id, run_id, &node_id).await;
                        }
                    }
                }
                _ = ctx.cancelled(), if !cancelled => {
                    warn!(%run_id, in_flight, "run cancelled, no further tasks will be dispatched");
                    cancelled = true;
                }
            }
        }

        if cancelled {
            let pending: Vec<String> = graph
                .nodes()
                .filter(|n| n.state() == TaskState::Pending)
                .map(|n| n.id().to_string())
                .collect();
            for id in pending {
                graph.set_state(&id, TaskState::Skipped);
                self.persist(&graph_id, run_id, &id, TaskState::Skipped, 0, None).await;
            }
        }

        self.enter(&mut phase, RunPhase::Completed, run_id, &graph_id);
        let result = Self::finish(graph, run_id, started_at, None, cancelled, ledger);
        info!(
            %run_id,
            graph = %graph_id,
            status = ?result.overall,
            failed = result.failed().len(),
            skipped = result.skipped().len(),
            "run finished"
        );
        result
    }

    fn enter(&self, phase: &mut RunPhase, next: RunPhase, run_id: Uuid, graph_id: &str) {
        let from = *phase;
        debug!(%run_id, graph = graph_id, ?from, to = ?next, "run phase transition");
        *phase = next;
    }

    fn spawn_node(
        &self,
        node: &TaskNode,
        run_id: Uuid,
        credentials: Credentials,
        ctx: CancellationToken,
        semaphore: Arc<Semaphore>,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) {
        let node_id = node.id().to_string();
        let operator = node.operator().clone();
        let policy = node
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| RetryPolicy::from(&self.config.default_retry));
        let attempt_timeout = node
            .attempt_timeout()
            .unwrap_or_else(|| self.config.default_timeout());

        info!(%run_id, node = %node_id, operator = operator.kind(), "dispatching task");

        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let retry_executor = RetryExecutor::new(policy, attempt_timeout);
                    retry_executor
                        .execute_with_retry(ctx.clone(), &node_id, |attempt| {
                            let op_ctx = OperatorContext {
                                run_id,
                                node_id: node_id.clone(),
                                attempt,
                                credentials: credentials.clone(),
                                cancel: ctx.clone(),
                            };
                            let operator = operator.clone();

                            async move {
                                debug!(node = %op_ctx.node_id, attempt, "starting attempt");
                                AssertUnwindSafe(operator.execute(&op_ctx))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|panic| {
                                        Err(OperatorError::Panicked(panic_message(panic.as_ref())))
                                    })
                            }
                        })
                        .await
                }
                Err(_) => RetryOutcome {
                    result: Err(OperatorError::Cancelled),
                    attempts: 0,
                },
            };

            // the scheduler holds a sender for the whole run, so this only
            // fails if the run itself was dropped
            let _ = completion_tx.send(Completion { node_id, outcome });
        });
    }

    /// Marks every pending node reachable from `failed` as skipped.
    async fn skip_downstream(
        &self,
        graph: &mut TaskGraph,
        graph_id: &str,
        run_id: Uuid,
        failed: &str,
    ) {
        for id in graph.downstream(failed) {
            let is_pending = graph.node(&id).map(|n| n.state()) == Some(TaskState::Pending);
            if is_pending {
                info!(%run_id, node = %id, upstream = failed, "skipping task, upstream failed");
                graph.set_state(&id, TaskState::Skipped);
                self.persist(graph_id, run_id, &id, TaskState::Skipped, 0, None).await;
            }
        }
    }

    async fn persist(
        &self,
        graph_id: &str,
        run_id: Uuid,
        node_id: &str,
        state: TaskState,
        attempts: u32,
        error: Option<OperatorError>,
    ) {
        let Some(store) = &self.state_store else { return };
        let record = NodeRecord {
            run_id,
            node_id: node_id.to_string(),
            state,
            attempts,
            error,
        };
        if let Err(err) = store.upsert(graph_id, &record).await {
            warn!(%run_id, node = node_id, error = %err, "failed to persist node state");
        }
    }

    fn finish(
        graph: &TaskGraph,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        validation_error: Option<GraphError>,
        cancelled: bool,
        mut ledger: RunLedger,
    ) -> RunResult {
        let outcomes: BTreeMap<String, NodeOutcome> = graph
            .nodes()
            .map(|node| {
                let id = node.id().to_string();
                let outcome = NodeOutcome {
                    state: node.state(),
                    attempts: ledger.attempts.remove(&id).unwrap_or(0),
                    error: ledger.errors.remove(&id),
                };
                (id, outcome)
            })
            .collect();

        let any_failed = outcomes.values().any(|o| o.state == TaskState::Failed);
        let overall = if validation_error.is_some() || cancelled || any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        RunResult {
            graph_id: graph.graph_id().to_string(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            overall,
            validation_error,
            cancelled,
            completion_order: ledger.completion_order,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
