//! Execution state, aggregated results and execution events

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::phase::{PhaseStatus, SkipReason};

/// Workflow-level status of one execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::PartiallyCompleted | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a phase attempt failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseErrorKind {
    /// Bound or fallback worker is not in the registry
    WorkerNotFound,

    /// Worker returned an error or a failure status
    WorkerFailed,

    /// Attempt exceeded its tier budget
    Timeout,

    /// Reading inputs or publishing the output failed
    Context,
}

/// Terminal error of one phase attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub kind: PhaseErrorKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    pub message: String,
}

impl PhaseError {
    pub fn new(kind: PhaseErrorKind, worker_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            worker_id: worker_id.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker_id {
            Some(worker) => write!(f, "{:?} on worker {}: {}", self.kind, worker, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// One dispatch of a phase to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
}

/// Per-phase bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,

    /// Attempts made beyond the first
    pub retry_count: u32,

    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            retry_count: 0,
            attempts: Vec::new(),
            error: None,
            skip_reason: None,
        }
    }
}

impl PhaseState {
    /// Worker of the last attempt
    pub fn last_worker(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.worker_id.as_str())
    }
}

/// Output of a succeeded phase, copied out of the context store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub phase_id: String,
    pub context_key: String,
    pub worker_id: Option<String>,
    pub value: Value,
}

/// A phase that did not succeed, with its terminal reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub optional: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
}

/// Final result of a run, built once it reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub status: RunStatus,

    /// Succeeded phases in execution order
    pub outputs: Vec<PhaseOutput>,

    /// Failed and skipped phases
    pub manifest: Vec<ManifestEntry>,
}

impl AggregatedResult {
    pub fn output(&self, phase_id: &str) -> Option<&PhaseOutput> {
        self.outputs.iter().find(|o| o.phase_id == phase_id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.manifest
            .iter()
            .filter(|m| m.status == PhaseStatus::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.manifest
            .iter()
            .filter(|m| m.status == PhaseStatus::Skipped)
    }
}

/// Mutable state of one execution run, owned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: RunStatus,
    pub phases: BTreeMap<String, PhaseState>,

    /// Conditional analysis phase id -> selected branch phase id
    #[serde(default)]
    pub selected_branches: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_result: Option<AggregatedResult>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new<I, S>(workflow_id: Uuid, workflow_version: u32, phase_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id,
            workflow_version,
            status: RunStatus::Pending,
            phases: phase_ids
                .into_iter()
                .map(|id| (id.into(), PhaseState::default()))
                .collect(),
            selected_branches: BTreeMap::new(),
            aggregated_result: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status_of(&self, phase_id: &str) -> Option<PhaseStatus> {
        self.phases.get(phase_id).map(|p| p.status)
    }

    /// Phase id -> status
    pub fn phase_statuses(&self) -> BTreeMap<String, PhaseStatus> {
        self.phases
            .iter()
            .map(|(id, p)| (id.clone(), p.status))
            .collect()
    }

    /// Phase id -> retries used
    pub fn retry_counts(&self) -> BTreeMap<String, u32> {
        self.phases
            .iter()
            .map(|(id, p)| (id.clone(), p.retry_count))
            .collect()
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.values().filter(|p| p.status == status).count()
    }

    /// Apply a status transition, refusing illegal ones
    pub fn transition(&mut self, phase_id: &str, next: PhaseStatus) -> bool {
        let Some(phase) = self.phases.get_mut(phase_id) else {
            warn!(phase = %phase_id, "Transition for unknown phase");
            return false;
        };

        if !phase.status.can_transition_to(next) {
            warn!(
                phase = %phase_id,
                from = %phase.status,
                to = %next,
                "Illegal phase transition ignored"
            );
            return false;
        }

        phase.status = next;
        true
    }

    /// Record the start of an attempt and move the phase to running
    pub fn begin_attempt(&mut self, phase_id: &str, worker_id: &str) -> u32 {
        if !self.transition(phase_id, PhaseStatus::Running) {
            return 0;
        }
        let Some(phase) = self.phases.get_mut(phase_id) else {
            return 0;
        };

        let attempt = phase.attempts.len() as u32 + 1;
        if attempt > 1 {
            phase.retry_count += 1;
        }
        phase.error = None;
        phase.attempts.push(AttemptRecord {
            attempt,
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        attempt
    }

    /// Close the running attempt as failed
    pub fn fail_attempt(&mut self, phase_id: &str, error: PhaseError) {
        if !self.transition(phase_id, PhaseStatus::Failed) {
            return;
        }
        if let Some(phase) = self.phases.get_mut(phase_id) {
            if let Some(attempt) = phase.attempts.last_mut() {
                attempt.finished_at = Some(Utc::now());
                attempt.error = Some(error.clone());
            }
            phase.error = Some(error);
        }
    }

    /// Close the running attempt as succeeded
    pub fn succeed(&mut self, phase_id: &str) {
        if !self.transition(phase_id, PhaseStatus::Succeeded) {
            return;
        }
        if let Some(attempt) = self
            .phases
            .get_mut(phase_id)
            .and_then(|p| p.attempts.last_mut())
        {
            attempt.finished_at = Some(Utc::now());
        }
    }

    pub fn skip(&mut self, phase_id: &str, reason: SkipReason) -> bool {
        if !self.transition(phase_id, PhaseStatus::Skipped) {
            return false;
        }
        if let Some(phase) = self.phases.get_mut(phase_id) {
            phase.skip_reason = Some(reason);
        }
        true
    }

    /// Whether every phase reached a terminal status
    pub fn all_terminal(&self) -> bool {
        self.phases.values().all(|p| p.status.is_terminal())
    }
}

/// Observable state transitions of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStarted {
        run_id: Uuid,
        workflow_id: Uuid,
    },
    PhaseStarted {
        phase_id: String,
        worker_id: String,
        attempt: u32,
    },
    PhaseSucceeded {
        phase_id: String,
        worker_id: String,
    },
    PhaseAttemptFailed {
        phase_id: String,
        attempt: u32,
        error: PhaseError,
        will_retry: bool,
    },
    PhaseFailed {
        phase_id: String,
        error: PhaseError,
    },
    PhaseSkipped {
        phase_id: String,
        reason: SkipReason,
    },
    BranchSelected {
        analysis_phase: String,
        branch: String,
    },
    ContextArchived {
        key: String,
    },
    WorkflowFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

impl ExecutionEvent {
    /// Phase the event refers to, if any
    pub fn phase_id(&self) -> Option<&str> {
        match self {
            Self::PhaseStarted { phase_id, .. }
            | Self::PhaseSucceeded { phase_id, .. }
            | Self::PhaseAttemptFailed { phase_id, .. }
            | Self::PhaseFailed { phase_id, .. }
            | Self::PhaseSkipped { phase_id, .. } => Some(phase_id),
            Self::BranchSelected { analysis_phase, .. } => Some(analysis_phase),
            _ => None,
        }
    }
}
