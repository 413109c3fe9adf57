//! Common test utilities for Conductor tests
//!
//! Provides a scripted worker executor, a sample registry and helpers for
//! building workflow documents by hand.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use conductor::config::ConductorConfig;
use conductor::error::{ConductorError, Result};
use conductor::orchestration::{
    BoundPhase, Phase, PhaseExecutor, WorkerInvocation, WorkerResponse, WorkflowDocument,
    WorkflowPattern,
};
use conductor::registry::{CapabilityRegistry, ResourceTier, WorkerDescriptor};

/// How a scripted worker behaves
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Number of calls answered with a failure before succeeding
    pub failures: u32,

    /// Fail with an executor error instead of a failure response
    pub error: bool,

    /// Delay before answering
    pub delay: Option<Duration>,

    /// Output returned on success
    pub output: Option<Value>,
}

impl Script {
    pub fn always_fail() -> Self {
        Self {
            failures: u32::MAX,
            ..Default::default()
        }
    }

    pub fn fail_times(failures: u32) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn returning(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }
}

/// Executor whose workers follow per-worker scripts and record every call
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    phase_outputs: Mutex<HashMap<String, Value>>,
    failures_used: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<WorkerInvocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, worker_id: &str, script: Script) {
        self.scripts.lock().insert(worker_id.to_string(), script);
    }

    /// Output returned for a phase, whichever worker runs it
    pub fn phase_output(&self, phase_id: &str, output: Value) {
        self.phase_outputs.lock().insert(phase_id.to_string(), output);
    }

    pub fn calls(&self) -> Vec<WorkerInvocation> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, phase_id: &str) -> Vec<WorkerInvocation> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.phase_id == phase_id)
            .cloned()
            .collect()
    }

    /// Worker ids in the order a phase's attempts used them
    pub fn workers_for(&self, phase_id: &str) -> Vec<String> {
        self.calls_for(phase_id)
            .into_iter()
            .map(|c| c.worker_id)
            .collect()
    }

    pub fn phases_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.phase_id.clone()).collect()
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute(&self, worker: &WorkerDescriptor, invocation: WorkerInvocation) -> Result<WorkerResponse> {
        self.calls.lock().push(invocation.clone());
        let script = self.scripts.lock().get(&worker.id).cloned().unwrap_or_default();

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = {
            let mut used = self.failures_used.lock();
            let count = used.entry(worker.id.clone()).or_insert(0);
            if *count < script.failures {
                *count += 1;
                true
            } else {
                false
            }
        };

        if should_fail {
            if script.error {
                return Err(ConductorError::Other(anyhow::anyhow!("{} crashed", worker.id)));
            }
            return Ok(WorkerResponse::failure(format!("{} failed", worker.id)));
        }

        let output = self
            .phase_outputs
            .lock()
            .get(&invocation.phase_id)
            .cloned()
            .or(script.output)
            .unwrap_or_else(|| {
                json!({
                    "phase": invocation.phase_id,
                    "worker": worker.id,
                    "inputs": invocation.context.keys().collect::<Vec<_>>(),
                })
            });

        Ok(WorkerResponse::success(output).with_delta(json!({ "attempt": invocation.attempt })))
    }
}

/// Registry with one specialist per canonical stage plus a generalist
pub fn sample_registry() -> Arc<CapabilityRegistry> {
    Arc::new(
        CapabilityRegistry::from_descriptors([
            WorkerDescriptor::new("analyst", ["research", "analysis"], ResourceTier::Light),
            WorkerDescriptor::new("architect", ["architecture", "design", "planning"], ResourceTier::Standard),
            WorkerDescriptor::new("coder", ["implementation", "coding"], ResourceTier::Heavy),
            WorkerDescriptor::new("backup-coder", ["implementation"], ResourceTier::Heavy),
            WorkerDescriptor::new("tester", ["testing", "quality"], ResourceTier::Standard),
            WorkerDescriptor::new("reviewer", ["review", "quality"], ResourceTier::Light),
            WorkerDescriptor::new("writer", ["documentation", "writing"], ResourceTier::Light),
            WorkerDescriptor::new("integrator", ["aggregation", "synthesis"], ResourceTier::Standard),
            WorkerDescriptor::new("generalist", ["general"], ResourceTier::Standard),
        ])
        .expect("sample registry is valid"),
    )
}

/// Default configuration with short per-tier timeouts
pub fn test_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.execution.light_timeout_ms = 2_000;
    config.execution.standard_timeout_ms = 2_000;
    config.execution.heavy_timeout_ms = 2_000;
    config
}

pub fn bound(phase: Phase, worker_id: &str) -> BoundPhase {
    BoundPhase {
        phase,
        worker_id: worker_id.to_string(),
    }
}

pub fn document(pattern: WorkflowPattern, phases: Vec<BoundPhase>) -> WorkflowDocument {
    WorkflowDocument::new("test workflow", pattern, phases, BTreeMap::new())
}

/// `fallbacks` lists `(phase, worker)` pairs in priority order
pub fn document_with_fallbacks(
    pattern: WorkflowPattern,
    phases: Vec<BoundPhase>,
    fallbacks: &[(&str, &str)],
) -> WorkflowDocument {
    let mut by_phase: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (phase, worker) in fallbacks {
        by_phase.entry(phase.to_string()).or_default().push(worker.to_string());
    }
    WorkflowDocument::new("test workflow", pattern, phases, by_phase)
}

/// design -> implement -> test, bound to the sample specialists
pub fn sequential_chain() -> WorkflowDocument {
    document(
        WorkflowPattern::Sequential,
        vec![
            bound(Phase::new("phase-1", "design"), "architect"),
            bound(Phase::new("phase-2", "implement").after(["phase-1"]), "coder"),
            bound(Phase::new("phase-3", "test").after(["phase-2"]), "tester"),
        ],
    )
}

/// Two independent branches joined by an aggregation phase
pub fn parallel_pair() -> WorkflowDocument {
    document(
        WorkflowPattern::Parallel,
        vec![
            bound(Phase::new("phase-1", "frontend"), "coder"),
            bound(Phase::new("phase-2", "backend"), "backup-coder"),
            bound(
                Phase::new("phase-3", "aggregate").after(["phase-1", "phase-2"]),
                "integrator",
            ),
        ],
    )
}

/// Analysis with two conditional branches sharing a merge phase
pub fn conditional_fork() -> WorkflowDocument {
    document(
        WorkflowPattern::Conditional,
        vec![
            bound(Phase::new("phase-1", "analysis"), "analyst"),
            bound(
                Phase::new("phase-2", "hotfix")
                    .with_condition("regression")
                    .after(["phase-1"]),
                "coder",
            ),
            bound(
                Phase::new("phase-3", "refactor")
                    .with_condition("otherwise")
                    .after(["phase-1"]),
                "backup-coder",
            ),
            bound(
                Phase::new("phase-4", "merge").after(["phase-2", "phase-3"]),
                "integrator",
            ),
        ],
    )
}
