//! Execution Engine
//!
//! Runs a validated workflow document. A single coordinator task owns the
//! scheduling decisions; each dispatched phase runs in its own Tokio task and
//! reports back through a `FuturesUnordered` set.
//!
//! # Scheduling
//!
//! - A phase is dispatched once every dependency is resolved: succeeded, failed
//!   but optional (when tolerated), or an unselected conditional branch
//! - Sequential workflows run one phase at a time; other patterns run up to
//!   `max_parallel_phases` phases concurrently
//! - Inputs are copied out of the context store at dispatch time, so
//!   concurrent phases never see each other's uncommitted output
//!
//! # Retry
//!
//! Attempt `n` (zero-based) uses candidate `min(n, len - 1)` of the bound
//! worker followed by its fallbacks. A phase gets at most `max_retries + 1`
//! attempts. Timeouts, worker errors, failure responses and unknown workers
//! all count as failed attempts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dag::DependencyGraph;
use super::phase::{Phase, PhaseStatus, SkipReason};
use super::state::{
    AggregatedResult, ExecutionEvent, ExecutionState, ManifestEntry, PhaseError, PhaseErrorKind,
    PhaseOutput, PhaseState, RunStatus,
};
use super::validator::WorkflowValidator;
use super::workflow::{WorkflowDocument, WorkflowPattern, WorkflowRecord};
use crate::config::{ConductorConfig, ContextConfig, ExecutionConfig};
use crate::context::{ContextSnapshot, ContextStore};
use crate::error::{ConductorError, Result};
use crate::registry::{CapabilityRegistry, WorkerDescriptor};

// ============================================================================
// Worker invocation boundary
// ============================================================================

/// Everything a worker receives for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub run_id: Uuid,
    pub phase_id: String,
    pub worker_id: String,
    pub attempt: u32,
    pub prompt: String,

    /// Copies of the phase's declared input entries
    pub context: ContextSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Failure,
}

/// Result reported by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: WorkerStatus,
    pub output: Value,

    #[serde(default)]
    pub context_delta: Value,
}

impl WorkerResponse {
    pub fn success(output: Value) -> Self {
        Self {
            status: WorkerStatus::Success,
            output,
            context_delta: Value::Null,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failure,
            output: Value::String(message.into()),
            context_delta: Value::Null,
        }
    }

    pub fn with_delta(mut self, delta: Value) -> Self {
        self.context_delta = delta;
        self
    }
}

/// Performs phase work on behalf of a worker
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, worker: &WorkerDescriptor, invocation: WorkerInvocation) -> Result<WorkerResponse>;
}

/// Executor that answers every invocation with a description of itself
///
/// Used by the CLI `run` command for dry runs.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

#[async_trait]
impl PhaseExecutor for EchoExecutor {
    async fn execute(&self, worker: &WorkerDescriptor, invocation: WorkerInvocation) -> Result<WorkerResponse> {
        Ok(WorkerResponse::success(json!({
            "worker": worker.id,
            "phase": invocation.phase_id,
            "attempt": invocation.attempt,
            "prompt": invocation.prompt,
            "inputs": invocation.context.keys().collect::<Vec<_>>(),
        })))
    }
}

// ============================================================================
// Execution handle
// ============================================================================

/// Shared view of a run, kept by the orchestrator for status queries
#[derive(Debug, Clone)]
pub struct RunTracker {
    pub run_id: Uuid,
    state: Arc<RwLock<ExecutionState>>,
    cancel: CancellationToken,
}

impl RunTracker {
    pub fn state(&self) -> ExecutionState {
        self.state.read().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// When the run reached a terminal status, if it has
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        if state.status.is_terminal() {
            state.finished_at
        } else {
            None
        }
    }
}

/// Handle to a running workflow
pub struct ExecutionHandle {
    run_id: Uuid,
    document: Arc<WorkflowDocument>,
    state: Arc<RwLock<ExecutionState>>,
    context: Arc<ContextStore>,
    cancel: CancellationToken,
    events: broadcast::Sender<ExecutionEvent>,
    first_receiver: Mutex<Option<broadcast::Receiver<ExecutionEvent>>>,
    task: JoinHandle<()>,
}

impl ExecutionHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn document(&self) -> &WorkflowDocument {
        &self.document
    }

    /// Snapshot of the current execution state
    pub fn state(&self) -> ExecutionState {
        self.state.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.read().status
    }

    /// The run's context store
    pub fn context(&self) -> Arc<ContextStore> {
        Arc::clone(&self.context)
    }

    /// Subscribe to execution events
    ///
    /// The first subscriber receives every event since the run started (up to
    /// the channel capacity); later subscribers see events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.first_receiver
            .lock()
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Stop dispatching and skip every pending or running phase
    pub fn cancel(&self) {
        info!(run = %self.run_id, "Cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn tracker(&self) -> RunTracker {
        RunTracker {
            run_id: self.run_id,
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        }
    }

    /// Record of the document, current state and live context entries
    pub fn record(&self) -> WorkflowRecord {
        WorkflowRecord::new(
            self.document.as_ref().clone(),
            Some(self.state()),
            self.context.export(),
        )
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> Result<ExecutionState> {
        self.task
            .await
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("execution task failed: {}", e)))?;
        Ok(self.state.read().clone())
    }
}

/// Next event from a run's stream, skipping past events lost to lag
///
/// Returns `None` once the run has dropped its sender.
pub async fn next_event(events: &mut broadcast::Receiver<ExecutionEvent>) -> Option<ExecutionEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber fell behind, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// ============================================================================
// Execution engine
// ============================================================================

/// Runs workflow documents
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    executor: Arc<dyn PhaseExecutor>,
    config: ExecutionConfig,
    context_config: ContextConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        executor: Arc<dyn PhaseExecutor>,
        config: &ConductorConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            config: config.execution.clone(),
            context_config: config.context.clone(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Start executing `document`
    ///
    /// The document structure is rechecked first. Must be called from within a
    /// Tokio runtime.
    pub fn execute(&self, document: WorkflowDocument) -> Result<ExecutionHandle> {
        WorkflowValidator::structural().validate(&document).into_result()?;

        let state = ExecutionState::new(
            document.id(),
            document.version(),
            document.phases().iter().map(|b| b.phase.id.clone()),
        );
        let context = Arc::new(ContextStore::new(&self.context_config));
        self.launch(document, state, context)
    }

    /// Continue a recorded run
    ///
    /// Succeeded phases whose output is present in the record are kept, as are
    /// branch decisions. Everything else runs again.
    pub fn resume(&self, record: WorkflowRecord) -> Result<ExecutionHandle> {
        let document = record.document;
        WorkflowValidator::structural().validate(&document).into_result()?;

        let context = Arc::new(ContextStore::new(&self.context_config));
        context.import(record.context);

        let mut state = ExecutionState::new(
            document.id(),
            document.version(),
            document.phases().iter().map(|b| b.phase.id.clone()),
        );

        if let Some(previous) = record.state {
            state.selected_branches = previous.selected_branches.clone();
            for bound in document.phases() {
                let phase = &bound.phase;
                let Some(old) = previous.phases.get(&phase.id) else {
                    continue;
                };
                let keep = match old.status {
                    PhaseStatus::Succeeded => context.contains(&phase.output_context_key),
                    PhaseStatus::Skipped => old
                        .skip_reason
                        .as_ref()
                        .is_some_and(SkipReason::is_branch_not_taken),
                    _ => false,
                };
                if keep {
                    state.phases.insert(phase.id.clone(), old.clone());
                } else {
                    state.phases.insert(phase.id.clone(), PhaseState::default());
                }
            }
        }

        info!(
            workflow = %document.revision(),
            carried = state.count(PhaseStatus::Succeeded),
            "Resuming workflow"
        );
        self.launch(document, state, context)
    }

    /// Execute and wait for the terminal state
    pub async fn run(&self, document: WorkflowDocument) -> Result<ExecutionState> {
        self.execute(document)?.wait().await
    }

    fn launch(
        &self,
        document: WorkflowDocument,
        state: ExecutionState,
        context: Arc<ContextStore>,
    ) -> Result<ExecutionHandle> {
        let run_id = state.run_id;
        let document = Arc::new(document);
        let state = Arc::new(RwLock::new(state));
        let cancel = CancellationToken::new();
        let (events, first_receiver) = broadcast::channel(self.config.event_buffer.max(1));

        let coordinator = Coordinator::new(
            Arc::clone(&document),
            Arc::clone(&state),
            Arc::clone(&context),
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            self.config.clone(),
            cancel.clone(),
            events.clone(),
        )?;

        let task = tokio::spawn(coordinator.run());

        Ok(ExecutionHandle {
            run_id,
            document,
            state,
            context,
            cancel,
            events,
            first_receiver: Mutex::new(Some(first_receiver)),
            task,
        })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// How a finished phase affects its dependents
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Satisfied,
    NotTaken { selected: String },
    Unavailable,
}

enum PhaseOutcome {
    Succeeded { output: Value },
    Failed(PhaseError),
    Cancelled,
}

type PhaseFuture = BoxFuture<'static, (String, std::result::Result<PhaseOutcome, tokio::task::JoinError>)>;

/// Everything one phase task needs
#[derive(Clone)]
struct PhaseContext {
    run_id: Uuid,
    state: Arc<RwLock<ExecutionState>>,
    context: Arc<ContextStore>,
    registry: Arc<CapabilityRegistry>,
    executor: Arc<dyn PhaseExecutor>,
    config: ExecutionConfig,
    cancel: CancellationToken,
    events: broadcast::Sender<ExecutionEvent>,
}

impl PhaseContext {
    fn emit(&self, event: ExecutionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

struct Coordinator {
    document: Arc<WorkflowDocument>,
    order: Vec<String>,
    phases: HashMap<String, Phase>,
    groups: BTreeMap<String, Vec<String>>,
    consumers: HashMap<String, Vec<String>>,
    resolved: HashMap<String, Resolution>,
    in_flight: HashSet<String>,
    shared: PhaseContext,
    limit: usize,
    halted: bool,
    cancelled: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    fn new(
        document: Arc<WorkflowDocument>,
        state: Arc<RwLock<ExecutionState>>,
        context: Arc<ContextStore>,
        registry: Arc<CapabilityRegistry>,
        executor: Arc<dyn PhaseExecutor>,
        config: ExecutionConfig,
        cancel: CancellationToken,
        events: broadcast::Sender<ExecutionEvent>,
    ) -> Result<Self> {
        let graph = DependencyGraph::from_phases(document.phases().iter().map(|b| &b.phase));
        let order = graph.topological_order()?;

        let phases: HashMap<String, Phase> = document
            .phases()
            .iter()
            .map(|b| (b.phase.id.clone(), b.phase.clone()))
            .collect();

        let mut consumers: HashMap<String, Vec<String>> = HashMap::new();
        for phase in phases.values() {
            for key in &phase.input_context_keys {
                consumers.entry(key.clone()).or_default().push(phase.id.clone());
            }
        }

        let limit = match document.pattern() {
            WorkflowPattern::Sequential => 1,
            _ => config.max_parallel_phases.max(1),
        };

        let tolerate = config.tolerate_optional_failures;
        let mut resolved = HashMap::new();
        {
            let state = state.read();
            for (id, phase_state) in &state.phases {
                let optional = phases.get(id).is_some_and(|p| p.optional);
                if let Some(resolution) = resolution_of(phase_state, optional, tolerate) {
                    resolved.insert(id.clone(), resolution);
                }
            }
        }

        Ok(Self {
            groups: document.conditional_groups(),
            document,
            order,
            phases,
            consumers,
            resolved,
            in_flight: HashSet::new(),
            shared: PhaseContext {
                run_id: Uuid::nil(),
                state,
                context,
                registry,
                executor,
                config,
                cancel,
                events,
            },
            limit,
            halted: false,
            cancelled: false,
        })
    }

    async fn run(mut self) {
        let run_id = {
            let mut state = self.shared.state.write();
            state.status = RunStatus::Running;
            state.started_at = Some(chrono::Utc::now());
            state.run_id
        };
        self.shared.run_id = run_id;

        info!(
            run = %run_id,
            workflow = %self.document.revision(),
            pattern = %self.document.pattern(),
            phases = self.order.len(),
            "Workflow execution started"
        );
        self.shared.emit(ExecutionEvent::WorkflowStarted {
            run_id,
            workflow_id: self.document.id(),
        });

        let mut running: FuturesUnordered<PhaseFuture> = FuturesUnordered::new();

        loop {
            if !self.halted && !self.cancelled {
                self.settle_and_dispatch(&mut running);
            }

            if running.is_empty() {
                break;
            }

            let cancel = self.shared.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => {
                    info!(run = %run_id, "Workflow cancelled, draining running phases");
                    self.cancelled = true;
                }
                Some((phase_id, joined)) = running.next() => {
                    self.in_flight.remove(&phase_id);
                    let outcome = joined.unwrap_or_else(|e| {
                        PhaseOutcome::Failed(PhaseError::new(
                            PhaseErrorKind::WorkerFailed,
                            None,
                            format!("phase task aborted: {}", e),
                        ))
                    });
                    self.complete(&phase_id, outcome);
                }
            }
        }

        self.finish();
    }

    /// Resolve skips and dispatch ready phases, in topological order
    fn settle_and_dispatch(&mut self, running: &mut FuturesUnordered<PhaseFuture>) {
        let order = self.order.clone();
        for id in &order {
            if self.resolved.contains_key(id) || self.in_flight.contains(id) {
                continue;
            }
            if self.shared.state.read().status_of(id) != Some(PhaseStatus::Pending) {
                continue;
            }
            let Some(phase) = self.phases.get(id).cloned() else {
                continue;
            };

            let mut waiting = false;
            let mut blocked = None;
            let mut selected = None;
            let mut all_not_taken = !phase.depends_on.is_empty();

            for dep in &phase.depends_on {
                match self.resolved.get(dep) {
                    None => {
                        waiting = true;
                        all_not_taken = false;
                    }
                    Some(Resolution::Satisfied) => all_not_taken = false,
                    Some(Resolution::NotTaken { selected: s }) => selected = Some(s.clone()),
                    Some(Resolution::Unavailable) => {
                        blocked = Some(dep.clone());
                        all_not_taken = false;
                    }
                }
            }

            if let Some(dependency) = blocked {
                self.skip(id, SkipReason::UpstreamUnavailable { dependency });
            } else if waiting {
                continue;
            } else if all_not_taken {
                let selected = selected.unwrap_or_default();
                self.skip(id, SkipReason::BranchNotTaken { selected });
            } else if running.len() < self.limit {
                self.dispatch(phase, running);
            }
        }
    }

    fn dispatch(&mut self, phase: Phase, running: &mut FuturesUnordered<PhaseFuture>) {
        let phase_id = phase.id.clone();
        let candidates = self.document.candidates(&phase_id);

        let snapshot = match self.shared.context.snapshot(&phase.input_context_keys) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Attributed to the bound worker
                let worker_id = candidates.first().cloned().unwrap_or_default();
                let error = PhaseError::new(PhaseErrorKind::Context, Some(&worker_id), e.to_string());
                warn!(phase = %phase_id, worker = %worker_id, error = %error, "Could not read phase inputs");

                let attempt = {
                    let mut state = self.shared.state.write();
                    let attempt = state.begin_attempt(&phase_id, &worker_id);
                    state.fail_attempt(&phase_id, error.clone());
                    attempt
                };
                self.shared.emit(ExecutionEvent::PhaseStarted {
                    phase_id: phase_id.clone(),
                    worker_id,
                    attempt,
                });
                self.shared.emit(ExecutionEvent::PhaseAttemptFailed {
                    phase_id: phase_id.clone(),
                    attempt,
                    error: error.clone(),
                    will_retry: false,
                });
                self.shared.emit(ExecutionEvent::PhaseFailed {
                    phase_id: phase_id.clone(),
                    error: error.clone(),
                });
                self.complete(&phase_id, PhaseOutcome::Failed(error));
                return;
            }
        };

        debug!(
            phase = %phase_id,
            candidates = ?candidates,
            inputs = snapshot.len(),
            "Dispatching phase"
        );

        self.in_flight.insert(phase_id.clone());
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_phase(shared, phase, candidates, snapshot));
        running.push(async move { (phase_id, handle.await) }.boxed());
    }

    fn skip(&mut self, phase_id: &str, reason: SkipReason) {
        if !self.shared.state.write().skip(phase_id, reason.clone()) {
            return;
        }
        debug!(phase = %phase_id, reason = %reason, "Phase skipped");

        let resolution = match &reason {
            SkipReason::BranchNotTaken { selected } => Resolution::NotTaken {
                selected: selected.clone(),
            },
            _ => Resolution::Unavailable,
        };
        self.resolved.insert(phase_id.to_string(), resolution);
        self.shared.emit(ExecutionEvent::PhaseSkipped {
            phase_id: phase_id.to_string(),
            reason,
        });
        self.archive_consumed_inputs(phase_id);
    }

    fn complete(&mut self, phase_id: &str, outcome: PhaseOutcome) {
        let optional = self.phases.get(phase_id).is_some_and(|p| p.optional);

        match outcome {
            PhaseOutcome::Succeeded { output } => {
                self.resolved.insert(phase_id.to_string(), Resolution::Satisfied);
                if let Some(branches) = self.groups.get(phase_id).cloned() {
                    self.select_branch(phase_id, &branches, &output);
                }
            }
            PhaseOutcome::Failed(error) => {
                if optional {
                    warn!(phase = %phase_id, error = %error, "Optional phase failed, continuing");
                    let resolution = if self.shared.config.tolerate_optional_failures {
                        Resolution::Satisfied
                    } else {
                        Resolution::Unavailable
                    };
                    self.resolved.insert(phase_id.to_string(), resolution);
                } else {
                    error!(phase = %phase_id, error = %error, "Required phase failed, halting workflow");
                    self.resolved.insert(phase_id.to_string(), Resolution::Unavailable);
                    self.halt(SkipReason::WorkflowFailed);
                }
            }
            PhaseOutcome::Cancelled => {
                self.skip(phase_id, SkipReason::Cancelled);
                return;
            }
        }

        self.archive_consumed_inputs(phase_id);
    }

    /// Pick one branch from the analysis output and skip its siblings
    fn select_branch(&mut self, analysis_id: &str, branches: &[String], output: &Value) {
        let selected = self.resolve_branch(branches, output);
        info!(analysis = %analysis_id, branch = %selected, "Conditional branch selected");

        self.shared
            .state
            .write()
            .selected_branches
            .insert(analysis_id.to_string(), selected.clone());
        self.shared.emit(ExecutionEvent::BranchSelected {
            analysis_phase: analysis_id.to_string(),
            branch: selected.clone(),
        });

        for branch in branches.iter().filter(|b| **b != selected) {
            self.skip(
                branch,
                SkipReason::BranchNotTaken {
                    selected: selected.clone(),
                },
            );
        }
    }

    /// `output.branch` as a branch id, condition label or zero-based index;
    /// anything else selects the first branch
    fn resolve_branch(&self, branches: &[String], output: &Value) -> String {
        let first = branches.first().cloned().unwrap_or_default();
        let Some(choice) = output.get("branch") else {
            return first;
        };

        if let Some(index) = choice.as_u64() {
            return branches.get(index as usize).cloned().unwrap_or(first);
        }

        let Some(text) = choice.as_str().map(|s| s.trim().to_lowercase()) else {
            return first;
        };
        branches
            .iter()
            .find(|id| {
                id.to_lowercase() == text
                    || self
                        .phases
                        .get(*id)
                        .and_then(|p| p.condition.as_deref())
                        .is_some_and(|c| c.to_lowercase() == text)
            })
            .cloned()
            .unwrap_or(first)
    }

    /// Stop dispatching and skip every phase that has not started
    fn halt(&mut self, reason: SkipReason) {
        self.halted = true;
        for id in self.order.clone() {
            if self.resolved.contains_key(&id) || self.in_flight.contains(&id) {
                continue;
            }
            if self.shared.state.read().status_of(&id) == Some(PhaseStatus::Pending) {
                self.skip(&id, reason.clone());
            }
        }
    }

    /// Archive inputs of `phase_id` whose consumers have all finished
    fn archive_consumed_inputs(&self, phase_id: &str) {
        let Some(phase) = self.phases.get(phase_id) else {
            return;
        };

        for key in &phase.input_context_keys {
            let done = self
                .consumers
                .get(key)
                .map(|readers| readers.iter().all(|r| self.resolved.contains_key(r)))
                .unwrap_or(true);
            if !done || !self.shared.context.contains(key) {
                continue;
            }
            match self.shared.context.archive(key) {
                Ok(_) => self.shared.emit(ExecutionEvent::ContextArchived { key: key.clone() }),
                Err(e) => warn!(key = %key, error = %e, "Failed to archive context entry"),
            }
        }
    }

    fn finish(mut self) {
        if self.cancelled {
            for id in self.order.clone() {
                let status = self.shared.state.read().status_of(&id);
                if matches!(status, Some(PhaseStatus::Pending) | Some(PhaseStatus::Running)) {
                    self.skip(&id, SkipReason::Cancelled);
                }
            }
        }

        // Anything still pending could never become ready
        for id in self.order.clone() {
            if self.shared.state.read().status_of(&id) == Some(PhaseStatus::Pending) {
                self.skip(&id, SkipReason::WorkflowFailed);
            }
        }

        let status = self.final_status();
        let aggregated = self.aggregate(status);

        let run_id = {
            let mut state = self.shared.state.write();
            state.status = status;
            state.finished_at = Some(chrono::Utc::now());
            state.aggregated_result = Some(aggregated);
            state.run_id
        };

        if status == RunStatus::Completed && self.shared.config.gc_on_completion {
            self.shared.context.clear();
        }

        info!(run = %run_id, status = %status, "Workflow execution finished");
        self.shared
            .emit(ExecutionEvent::WorkflowFinished { run_id, status });
    }

    fn final_status(&self) -> RunStatus {
        let state = self.shared.state.read();
        let required_failed = state.phases.iter().any(|(id, p)| {
            p.status == PhaseStatus::Failed && !self.phases.get(id).is_some_and(|ph| ph.optional)
        });
        if required_failed {
            return RunStatus::Failed;
        }
        // A cancel that lands after the last phase resolved leaves nothing to stop
        let interrupted = state
            .phases
            .values()
            .any(|p| p.skip_reason.as_ref().is_some_and(SkipReason::is_cancelled));
        if interrupted {
            return RunStatus::Cancelled;
        }

        let degraded = state.phases.values().any(|p| match p.status {
            PhaseStatus::Failed => true,
            PhaseStatus::Skipped => !p
                .skip_reason
                .as_ref()
                .is_some_and(SkipReason::is_branch_not_taken),
            _ => false,
        });
        if degraded {
            RunStatus::PartiallyCompleted
        } else {
            RunStatus::Completed
        }
    }

    fn aggregate(&self, status: RunStatus) -> AggregatedResult {
        let state = self.shared.state.read();
        let mut outputs = Vec::new();
        let mut manifest = Vec::new();

        for id in &self.order {
            let (Some(phase), Some(phase_state)) = (self.phases.get(id), state.phases.get(id)) else {
                continue;
            };

            match phase_state.status {
                PhaseStatus::Succeeded => match self.shared.context.read(&phase.output_context_key) {
                    Ok(value) => outputs.push(PhaseOutput {
                        phase_id: id.clone(),
                        context_key: phase.output_context_key.clone(),
                        worker_id: phase_state.last_worker().map(str::to_string),
                        value,
                    }),
                    Err(e) => warn!(phase = %id, error = %e, "Succeeded phase output missing"),
                },
                PhaseStatus::Failed | PhaseStatus::Skipped => manifest.push(ManifestEntry {
                    phase_id: id.clone(),
                    status: phase_state.status,
                    optional: phase.optional,
                    skip_reason: phase_state.skip_reason.clone(),
                    error: phase_state.error.clone(),
                }),
                PhaseStatus::Pending | PhaseStatus::Running => {}
            }
        }

        AggregatedResult {
            status,
            outputs,
            manifest,
        }
    }
}

/// Resolution implied by a phase state carried into a run
fn resolution_of(state: &PhaseState, optional: bool, tolerate: bool) -> Option<Resolution> {
    match state.status {
        PhaseStatus::Succeeded => Some(Resolution::Satisfied),
        PhaseStatus::Skipped => match &state.skip_reason {
            Some(SkipReason::BranchNotTaken { selected }) => Some(Resolution::NotTaken {
                selected: selected.clone(),
            }),
            _ => Some(Resolution::Unavailable),
        },
        PhaseStatus::Failed if optional && tolerate => Some(Resolution::Satisfied),
        PhaseStatus::Failed => Some(Resolution::Unavailable),
        PhaseStatus::Pending | PhaseStatus::Running => None,
    }
}

// ============================================================================
// Phase task
// ============================================================================

fn prompt_for(phase: &Phase) -> String {
    let mut prompt = if phase.description.is_empty() {
        phase.name.clone()
    } else {
        phase.description.clone()
    };
    if let Some(condition) = &phase.condition {
        prompt.push_str(&format!("\n\nApplies when: {}", condition));
    }
    prompt
}

/// Run one phase through its attempts
async fn run_phase(
    shared: PhaseContext,
    phase: Phase,
    candidates: Vec<String>,
    snapshot: ContextSnapshot,
) -> PhaseOutcome {
    let max_attempts = shared.config.max_retries.saturating_add(1);
    let prompt = prompt_for(&phase);
    let mut last_error = PhaseError::new(PhaseErrorKind::WorkerNotFound, None, "no candidate workers");

    for index in 0..max_attempts {
        if shared.cancel.is_cancelled() {
            return PhaseOutcome::Cancelled;
        }

        let Some(worker_id) = candidates
            .get((index as usize).min(candidates.len().saturating_sub(1)))
            .cloned()
        else {
            break;
        };

        let attempt = shared.state.write().begin_attempt(&phase.id, &worker_id);
        shared.emit(ExecutionEvent::PhaseStarted {
            phase_id: phase.id.clone(),
            worker_id: worker_id.clone(),
            attempt,
        });

        let result = match shared.registry.get(&worker_id) {
            Err(_) => Err(PhaseError::new(
                PhaseErrorKind::WorkerNotFound,
                Some(&worker_id),
                format!("worker {} is not registered", worker_id),
            )),
            Ok(worker) => {
                let budget = shared.config.timeout_for(worker.resource_tier);
                let invocation = WorkerInvocation {
                    run_id: shared.run_id,
                    phase_id: phase.id.clone(),
                    worker_id: worker_id.clone(),
                    attempt,
                    prompt: prompt.clone(),
                    context: snapshot.clone(),
                };

                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => return PhaseOutcome::Cancelled,
                    result = tokio::time::timeout(budget, shared.executor.execute(&worker, invocation)) => {
                        match result {
                            Err(_) => Err(PhaseError::new(
                                PhaseErrorKind::Timeout,
                                Some(&worker_id),
                                format!("no response within {:?}", budget),
                            )),
                            Ok(Err(e)) => Err(PhaseError::new(
                                PhaseErrorKind::WorkerFailed,
                                Some(&worker_id),
                                e.to_string(),
                            )),
                            Ok(Ok(response)) if response.status == WorkerStatus::Failure => {
                                Err(PhaseError::new(
                                    PhaseErrorKind::WorkerFailed,
                                    Some(&worker_id),
                                    failure_message(&response.output),
                                ))
                            }
                            Ok(Ok(response)) => Ok(response),
                        }
                    }
                }
            }
        };

        let error = match result {
            Ok(response) => {
                let payload = json!({
                    "output": response.output,
                    "delta": response.context_delta,
                });
                match shared.context.put(&phase.output_context_key, payload, &phase.id) {
                    Ok(entry) => {
                        if let Err(e) = shared.context.enforce_hot_budget() {
                            warn!(error = %e, "Hot tier budget enforcement failed");
                        }
                        shared.state.write().succeed(&phase.id);
                        debug!(
                            phase = %phase.id,
                            worker = %worker_id,
                            attempt,
                            tier = %entry.tier,
                            "Phase succeeded"
                        );
                        shared.emit(ExecutionEvent::PhaseSucceeded {
                            phase_id: phase.id.clone(),
                            worker_id,
                        });
                        return PhaseOutcome::Succeeded {
                            output: response.output,
                        };
                    }
                    Err(e) => PhaseError::new(PhaseErrorKind::Context, Some(&worker_id), e.to_string()),
                }
            }
            Err(error) => error,
        };

        let will_retry = index + 1 < max_attempts;
        warn!(
            phase = %phase.id,
            worker = %worker_id,
            attempt,
            will_retry,
            error = %error,
            "Phase attempt failed"
        );
        shared.state.write().fail_attempt(&phase.id, error.clone());
        shared.emit(ExecutionEvent::PhaseAttemptFailed {
            phase_id: phase.id.clone(),
            attempt,
            error: error.clone(),
            will_retry,
        });
        last_error = error;
    }

    shared.emit(ExecutionEvent::PhaseFailed {
        phase_id: phase.id.clone(),
        error: last_error.clone(),
    });
    PhaseOutcome::Failed(last_error)
}

fn failure_message(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => "worker reported failure".to_string(),
        other => other.to_string(),
    }
}
