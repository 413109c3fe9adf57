//! Orchestration Engine
//!
//! Turns requirement text into an executable workflow and runs it.
//!
//! # Pipeline
//!
//! - [`TaskDecomposer`] splits requirements into phases following a pattern
//! - [`WorkerMatcher`] ranks registry workers for every phase
//! - [`WorkflowGenerator`] binds phases to workers and records fallbacks
//! - [`WorkflowValidator`] gates documents before execution
//! - [`ExecutionEngine`] dispatches phases, retries, falls back and aggregates
//!
//! [`Orchestrator`] wires the stages together behind the submission API.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod dag;
pub mod decomposer;
pub mod executor;
pub mod generator;
pub mod matcher;
pub mod phase;
pub mod state;
pub mod validator;
pub mod workflow;

pub use dag::DependencyGraph;
pub use decomposer::{
    Decomposition, IntentClassification, IntentClassifier, KeywordIntentClassifier, Stage,
    TaskDecomposer,
};
pub use executor::{
    next_event, EchoExecutor, ExecutionEngine, ExecutionHandle, PhaseExecutor, RunTracker,
    WorkerInvocation, WorkerResponse, WorkerStatus,
};
pub use generator::{check_structure, WorkflowGenerator};
pub use matcher::{SimilarityScorer, TokenOverlapSimilarity, WorkerMatch, WorkerMatcher};
pub use phase::{output_key_for, Phase, PhaseRole, PhaseStatus, SkipReason};
pub use state::{
    AggregatedResult, ExecutionEvent, ExecutionState, ManifestEntry, PhaseError, PhaseErrorKind,
    PhaseOutput, PhaseState, RunStatus,
};
pub use validator::{ValidationError, ValidationResult, ValidationWarning, WorkflowValidator};
pub use workflow::{BoundPhase, WorkflowDocument, WorkflowPattern, WorkflowRecord};

use crate::config::ConductorConfig;
use crate::error::{ConductorError, Result};
use crate::registry::CapabilityRegistry;

/// Body of a create-workflow request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub requirements: String,

    /// One of sequential, parallel, conditional, hybrid, auto; absent means auto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_hint: Option<String>,
}

impl CreateWorkflowRequest {
    pub fn new(requirements: impl Into<String>) -> Self {
        Self {
            requirements: requirements.into(),
            pattern_hint: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern_hint = Some(pattern.into());
        self
    }
}

/// Answer to a create-workflow request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created { document: WorkflowDocument },
    Rejected { validation: ValidationResult },
}

impl CreateOutcome {
    pub fn document(&self) -> Option<&WorkflowDocument> {
        match self {
            Self::Created { document } => Some(document),
            Self::Rejected { .. } => None,
        }
    }

    pub fn into_document(self) -> Result<WorkflowDocument> {
        match self {
            Self::Created { document } => Ok(document),
            Self::Rejected { validation } => Err(ConductorError::InvalidDocument(Box::new(validation))),
        }
    }
}

/// Error for the first required phase that failed, if any
///
/// A phase whose last attempt found no registered worker escalates as
/// [`ConductorError::WorkerNotFound`]. Runs that lose only optional phases are
/// not escalated.
pub fn escalate(document: &WorkflowDocument, state: &ExecutionState) -> Result<()> {
    for bound in document.phases() {
        let Some(phase_state) = state.phases.get(&bound.phase.id) else {
            continue;
        };
        if phase_state.status != PhaseStatus::Failed || bound.phase.optional {
            continue;
        }
        let (worker_id, reason) = match &phase_state.error {
            Some(error) => (
                error.worker_id.clone().unwrap_or_else(|| bound.worker_id.clone()),
                error.message.clone(),
            ),
            None => (bound.worker_id.clone(), "phase failed".to_string()),
        };
        if phase_state
            .error
            .as_ref()
            .is_some_and(|e| e.kind == PhaseErrorKind::WorkerNotFound)
        {
            return Err(ConductorError::WorkerNotFound { id: worker_id });
        }
        return Err(ConductorError::WorkerExecution {
            phase_id: bound.phase.id.clone(),
            worker_id,
            reason,
        });
    }

    if state.status == RunStatus::Cancelled {
        return Err(ConductorError::Cancelled);
    }
    Ok(())
}

/// Main orchestrator for planning and running workflows
pub struct Orchestrator {
    config: ConductorConfig,
    registry: Arc<CapabilityRegistry>,
    decomposer: TaskDecomposer,
    matcher: WorkerMatcher,
    generator: WorkflowGenerator,
    validator: WorkflowValidator,
    engine: ExecutionEngine,

    /// Runs started through this orchestrator; finished runs are kept up to
    /// `execution.retained_runs`
    runs: RwLock<HashMap<Uuid, RunTracker>>,
}

impl Orchestrator {
    /// Create an orchestrator with the keyword classifier and token-overlap scorer
    pub fn new(
        config: ConductorConfig,
        registry: Arc<CapabilityRegistry>,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Self {
        Self::with_collaborators(
            config,
            registry,
            executor,
            Arc::new(KeywordIntentClassifier),
            Arc::new(TokenOverlapSimilarity),
        )
    }

    /// Create an orchestrator with custom classification and similarity functions
    pub fn with_collaborators(
        config: ConductorConfig,
        registry: Arc<CapabilityRegistry>,
        executor: Arc<dyn PhaseExecutor>,
        classifier: Arc<dyn IntentClassifier>,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            decomposer: TaskDecomposer::with_classifier(config.decomposer.clone(), classifier),
            matcher: WorkerMatcher::with_scorer(Arc::clone(&registry), config.matcher.clone(), scorer),
            generator: WorkflowGenerator::new(config.matcher.fallback_count),
            validator: WorkflowValidator::new(Arc::clone(&registry)),
            engine: ExecutionEngine::new(Arc::clone(&registry), executor, &config),
            registry,
            config,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Decompose, match and generate without validating
    pub fn plan(&self, requirements: &str, hint: WorkflowPattern) -> Result<WorkflowDocument> {
        let decomposition = self.decomposer.decompose(requirements, hint)?;
        let matches = self.match_all(&decomposition.phases)?;
        self.generator.generate(
            requirements.trim(),
            decomposition.phases,
            &matches,
            decomposition.pattern,
        )
    }

    /// Handle a create-workflow request
    ///
    /// Decomposition, matching and structural failures are errors. A generated
    /// document that fails validation comes back as `Rejected`.
    pub fn create_workflow(&self, request: &CreateWorkflowRequest) -> Result<CreateOutcome> {
        let hint = match request.pattern_hint.as_deref() {
            Some(text) => text
                .parse::<WorkflowPattern>()
                .map_err(ConductorError::Decomposition)?,
            None => WorkflowPattern::Auto,
        };

        let document = self.plan(&request.requirements, hint)?;
        Ok(self.gate(document))
    }

    pub fn validate(&self, document: &WorkflowDocument) -> ValidationResult {
        self.validator.validate(document)
    }

    /// Produce the next version of `previous` for new requirements
    ///
    /// The pattern of `previous` is kept.
    pub fn refine_workflow(&self, previous: &WorkflowDocument, requirements: &str) -> Result<CreateOutcome> {
        let planned = self.plan(requirements, previous.pattern())?;
        let document = previous.refine(
            planned.requirements(),
            planned.phases().to_vec(),
            planned.fallbacks().clone(),
        );
        info!(
            workflow = %document.id(),
            version = document.version(),
            derived_from = ?document.derived_from(),
            "Refined workflow"
        );
        Ok(self.gate(document))
    }

    /// Start a document
    ///
    /// Only the structure is rechecked here. Workers are resolved when their
    /// phase is dispatched.
    pub fn execute_workflow(&self, document: WorkflowDocument) -> Result<ExecutionHandle> {
        let handle = self.engine.execute(document)?;
        self.track(&handle);
        Ok(handle)
    }

    /// Continue a recorded run
    pub fn resume(&self, record: WorkflowRecord) -> Result<ExecutionHandle> {
        let handle = self.engine.resume(record)?;
        self.track(&handle);
        Ok(handle)
    }

    /// Current state of a tracked run
    pub fn execution_status(&self, run_id: Uuid) -> Result<ExecutionState> {
        self.runs
            .read()
            .get(&run_id)
            .map(RunTracker::state)
            .ok_or(ConductorError::RunNotFound { run_id })
    }

    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        let runs = self.runs.read();
        let tracker = runs.get(&run_id).ok_or(ConductorError::RunNotFound { run_id })?;
        tracker.cancel();
        Ok(())
    }

    /// Ids of tracked runs
    pub fn runs(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.runs.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop tracking runs that reached a terminal status
    pub fn prune_finished(&self) -> usize {
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, tracker| tracker.finished_at().is_none());
        before - runs.len()
    }

    /// Track a new run, dropping the oldest finished runs beyond
    /// `execution.retained_runs`
    fn track(&self, handle: &ExecutionHandle) {
        let mut runs = self.runs.write();
        runs.insert(handle.run_id(), handle.tracker());

        let mut finished: Vec<_> = runs
            .values()
            .filter_map(|tracker| tracker.finished_at().map(|at| (at, tracker.run_id)))
            .collect();
        let retained = self.config.execution.retained_runs;
        if finished.len() <= retained {
            return;
        }

        finished.sort();
        let excess = finished.len() - retained;
        for (_, run_id) in finished.into_iter().take(excess) {
            runs.remove(&run_id);
        }
        debug!(pruned = excess, tracked = runs.len(), "Pruned finished runs");
    }

    fn match_all(&self, phases: &[Phase]) -> Result<HashMap<String, Vec<WorkerMatch>>> {
        phases
            .iter()
            .map(|phase| Ok((phase.id.clone(), self.matcher.match_phase(phase)?)))
            .collect()
    }

    fn gate(&self, document: WorkflowDocument) -> CreateOutcome {
        let validation = self.validator.validate(&document);
        if validation.is_valid() {
            for warning in &validation.warnings {
                warn!(workflow = %document.id(), %warning, "Validation warning");
            }
            CreateOutcome::Created { document }
        } else {
            warn!(
                workflow = %document.id(),
                errors = %validation.summary(),
                "Generated workflow rejected"
            );
            CreateOutcome::Rejected { validation }
        }
    }
}
