//! Workflow Validator
//!
//! Pure inspection of a document before execution. Checks run in this order:
//!
//! 1. the dependency graph resolves and is acyclic
//! 2. every bound worker exists in the registry
//! 3. every input context key is producible by a transitive dependency
//! 4. pattern-specific shape rules
//!
//! A cycle stops the checks after step 2, since reachability and shape are
//! meaningless on a cyclic graph. Issues that do not prevent execution are
//! reported as warnings.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dag::DependencyGraph;
use super::generator::{dangling_references, duplicate_output_keys};
use super::phase::Phase;
use super::workflow::{WorkflowDocument, WorkflowPattern};
use crate::error::{ConductorError, Result};
use crate::registry::CapabilityRegistry;

/// A defect that makes a document unexecutable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    EmptyWorkflow,
    UnresolvedPattern,
    DuplicatePhaseId {
        phase_id: String,
    },
    MissingDependency {
        phase_id: String,
        dependency_id: String,
    },
    CyclicDependency {
        phases: Vec<String>,
    },
    WorkerNotFound {
        phase_id: String,
        worker_id: String,
    },
    DuplicateOutputKey {
        key: String,
        phases: Vec<String>,
    },
    DanglingContextReference {
        phase_id: String,
        key: String,
    },
    PatternShape {
        pattern: WorkflowPattern,
        reason: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWorkflow => f.write_str("workflow has no phases"),
            Self::UnresolvedPattern => f.write_str("pattern 'auto' was never resolved"),
            Self::DuplicatePhaseId { phase_id } => write!(f, "duplicate phase id {}", phase_id),
            Self::MissingDependency {
                phase_id,
                dependency_id,
            } => write!(f, "phase {} depends on unknown phase {}", phase_id, dependency_id),
            Self::CyclicDependency { phases } => {
                write!(f, "cyclic dependency: {}", phases.join(" -> "))
            }
            Self::WorkerNotFound {
                phase_id,
                worker_id,
            } => write!(f, "phase {} is bound to unknown worker {}", phase_id, worker_id),
            Self::DuplicateOutputKey { key, phases } => {
                write!(f, "context key '{}' produced by {}", key, phases.join(", "))
            }
            Self::DanglingContextReference { phase_id, key } => {
                write!(f, "phase {} reads unproducible context key '{}'", phase_id, key)
            }
            Self::PatternShape { pattern, reason } => write!(f, "{} shape: {}", pattern, reason),
        }
    }
}

/// A non-fatal issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationWarning {
    NoFallbacks {
        phase_id: String,
    },
    UnknownFallbackWorker {
        phase_id: String,
        worker_id: String,
    },
    WorkerConflict {
        phase_id: String,
        worker_id: String,
        dependency_id: String,
        conflicting_worker: String,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFallbacks { phase_id } => write!(f, "phase {} has no fallback workers", phase_id),
            Self::UnknownFallbackWorker {
                phase_id,
                worker_id,
            } => write!(f, "phase {} lists unknown fallback worker {}", phase_id, worker_id),
            Self::WorkerConflict {
                phase_id,
                worker_id,
                dependency_id,
                conflicting_worker,
            } => write!(
                f,
                "worker {} of phase {} conflicts with {} of dependency {}",
                worker_id, phase_id, conflicting_worker, dependency_id
            ),
        }
    }
}

/// Outcome of validating a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    fn from_issues(errors: Vec<ValidationError>, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ValidationError::CyclicDependency { .. }))
    }

    /// One line per error, `ok` when valid
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return format!("ok ({} warnings)", self.warnings.len());
        }
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `Ok` when valid, `InvalidDocument` otherwise
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(ConductorError::InvalidDocument(Box::new(self)))
        }
    }
}

/// Inspects workflow documents
#[derive(Clone, Default)]
pub struct WorkflowValidator {
    registry: Option<Arc<CapabilityRegistry>>,
}

impl WorkflowValidator {
    /// Validator that also resolves workers against `registry`
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Validator for structure only (graph, context references, shape)
    pub fn structural() -> Self {
        Self { registry: None }
    }

    pub fn validate(&self, document: &WorkflowDocument) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let phases: Vec<&Phase> = document.phases().iter().map(|b| &b.phase).collect();

        if phases.is_empty() {
            errors.push(ValidationError::EmptyWorkflow);
        }
        if !document.pattern().is_concrete() {
            errors.push(ValidationError::UnresolvedPattern);
        }

        // 1. graph
        let mut seen = BTreeSet::new();
        for phase in &phases {
            if !seen.insert(phase.id.as_str()) {
                errors.push(ValidationError::DuplicatePhaseId {
                    phase_id: phase.id.clone(),
                });
            }
        }

        let graph = DependencyGraph::from_phases(phases.iter().copied());
        for (phase_id, dependency_id) in graph.missing_dependencies() {
            errors.push(ValidationError::MissingDependency {
                phase_id,
                dependency_id,
            });
        }

        let cycle = graph.find_cycle();
        if let Some(cycle) = &cycle {
            errors.push(ValidationError::CyclicDependency {
                phases: cycle.clone(),
            });
        }

        // 2. workers
        if let Some(registry) = &self.registry {
            self.check_workers(document, &graph, registry, &mut errors, &mut warnings);
        }

        if cycle.is_none() {
            // 3. context
            for (key, producers) in duplicate_output_keys(phases.iter().copied()) {
                errors.push(ValidationError::DuplicateOutputKey {
                    key,
                    phases: producers,
                });
            }
            for (phase_id, key) in dangling_references(phases.iter().copied()) {
                errors.push(ValidationError::DanglingContextReference { phase_id, key });
            }

            // 4. shape
            if !phases.is_empty() {
                if let Some(reason) = shape_violation(document, &graph) {
                    errors.push(ValidationError::PatternShape {
                        pattern: document.pattern(),
                        reason,
                    });
                }
            }
        }

        for bound in document.phases() {
            if document.fallbacks_for(&bound.phase.id).is_empty() {
                warnings.push(ValidationWarning::NoFallbacks {
                    phase_id: bound.phase.id.clone(),
                });
            }
        }

        let result = ValidationResult::from_issues(errors, warnings);
        debug!(
            workflow = %document.revision(),
            valid = result.valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Validated workflow"
        );
        result
    }

    fn check_workers(
        &self,
        document: &WorkflowDocument,
        graph: &DependencyGraph,
        registry: &CapabilityRegistry,
        errors: &mut Vec<ValidationError>,
        warnings: &mut Vec<ValidationWarning>,
    ) {
        for bound in document.phases() {
            let phase_id = &bound.phase.id;
            let Ok(worker) = registry.get(&bound.worker_id) else {
                errors.push(ValidationError::WorkerNotFound {
                    phase_id: phase_id.clone(),
                    worker_id: bound.worker_id.clone(),
                });
                continue;
            };

            for fallback in document.fallbacks_for(phase_id) {
                if !registry.contains(fallback) {
                    warnings.push(ValidationWarning::UnknownFallbackWorker {
                        phase_id: phase_id.clone(),
                        worker_id: fallback.clone(),
                    });
                }
            }

            for dependency_id in graph.dependencies(phase_id) {
                let Some(upstream) = document.phase(dependency_id) else {
                    continue;
                };
                let upstream_conflicts = registry
                    .get(&upstream.worker_id)
                    .map(|w| w.conflicts_with_worker(&worker.id))
                    .unwrap_or(false);

                if worker.conflicts_with_worker(&upstream.worker_id) || upstream_conflicts {
                    warnings.push(ValidationWarning::WorkerConflict {
                        phase_id: phase_id.clone(),
                        worker_id: worker.id.clone(),
                        dependency_id: dependency_id.clone(),
                        conflicting_worker: upstream.worker_id.clone(),
                    });
                }
            }
        }
    }
}

/// Pattern shape rule violated by the document, if any
fn shape_violation(document: &WorkflowDocument, graph: &DependencyGraph) -> Option<String> {
    match document.pattern() {
        WorkflowPattern::Sequential => sequential_shape(graph),
        WorkflowPattern::Parallel => parallel_shape(graph),
        WorkflowPattern::Conditional => conditional_shape(document, graph),
        WorkflowPattern::Hybrid => hybrid_shape(graph),
        WorkflowPattern::Auto => None,
    }
}

fn sequential_shape(graph: &DependencyGraph) -> Option<String> {
    let roots = graph.roots();
    if roots.len() != 1 {
        return Some(format!("expected one starting phase, found {}", roots.len()));
    }
    for id in graph.ids() {
        if graph.dependencies(id).count() > 1 || graph.dependents(id).count() > 1 {
            return Some(format!("phase {} branches; a sequential workflow is a single chain", id));
        }
    }
    None
}

/// Direct dependencies of `join` if there are at least two and they are mutually independent
fn independent_inputs(graph: &DependencyGraph, join: &str) -> Option<Vec<String>> {
    let inputs: Vec<String> = graph.dependencies(join).cloned().collect();
    if inputs.len() < 2 {
        return None;
    }
    for (i, a) in inputs.iter().enumerate() {
        for b in &inputs[i + 1..] {
            if !graph.independent(a, b) {
                return None;
            }
        }
    }
    Some(inputs)
}

fn parallel_shape(graph: &DependencyGraph) -> Option<String> {
    let sinks = graph.sinks();
    if sinks.len() != 1 {
        return Some(format!(
            "branches must converge on exactly one aggregation phase, found {} terminal phases",
            sinks.len()
        ));
    }
    if independent_inputs(graph, &sinks[0]).is_none() {
        return Some(format!(
            "aggregation phase {} needs at least two independent branches",
            sinks[0]
        ));
    }
    None
}

fn conditional_shape(document: &WorkflowDocument, graph: &DependencyGraph) -> Option<String> {
    let groups = document.conditional_groups();
    if groups.is_empty() {
        return Some("no analysis phase with conditional branches".to_string());
    }

    for (analysis, branches) in &groups {
        if branches.len() < 2 {
            return Some(format!(
                "analysis phase {} has {} branch, at least two are required",
                analysis,
                branches.len()
            ));
        }

        let mut merges: BTreeSet<Vec<String>> = BTreeSet::new();
        for branch in branches {
            merges.insert(graph.dependents(branch).cloned().collect());
        }
        let shared = merges.len() == 1 && merges.first().is_some_and(|m| m.len() == 1);
        if !shared {
            return Some(format!(
                "branches of {} must all feed the same single merge phase",
                analysis
            ));
        }
    }
    None
}

fn hybrid_shape(graph: &DependencyGraph) -> Option<String> {
    if graph.sinks().len() != 1 {
        return Some("a hybrid workflow must end in a single phase".to_string());
    }
    let has_join = graph
        .ids()
        .iter()
        .any(|id| independent_inputs(graph, id).is_some());
    if !has_join {
        return Some("no aggregation of at least two independent branches".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::workflow::BoundPhase;
    use std::collections::BTreeMap;

    fn bind(phases: Vec<Phase>) -> Vec<BoundPhase> {
        phases
            .into_iter()
            .map(|phase| BoundPhase {
                phase,
                worker_id: "w".into(),
            })
            .collect()
    }

    fn document(pattern: WorkflowPattern, phases: Vec<Phase>) -> WorkflowDocument {
        WorkflowDocument::new("req", pattern, bind(phases), BTreeMap::new())
    }

    #[test]
    fn test_cycle_reported_and_later_checks_skipped() {
        let doc = document(
            WorkflowPattern::Sequential,
            vec![
                Phase::new("a", "a").after(["b"]),
                Phase::new("b", "b").after(["a"]),
            ],
        );
        let result = WorkflowValidator::structural().validate(&doc);
        assert!(!result.valid);
        assert!(result.has_cycle());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_sequential_shape() {
        let chain = document(
            WorkflowPattern::Sequential,
            vec![Phase::new("a", "a"), Phase::new("b", "b").after(["a"])],
        );
        assert!(WorkflowValidator::structural().validate(&chain).valid);

        let fork = document(
            WorkflowPattern::Sequential,
            vec![
                Phase::new("a", "a"),
                Phase::new("b", "b").after(["a"]),
                Phase::new("c", "c").after(["a"]),
            ],
        );
        let result = WorkflowValidator::structural().validate(&fork);
        assert!(matches!(result.errors[0], ValidationError::PatternShape { .. }));
    }

    #[test]
    fn test_parallel_shape_requires_independent_branches() {
        let dependent = document(
            WorkflowPattern::Parallel,
            vec![
                Phase::new("a", "a"),
                Phase::new("b", "b").after(["a"]),
                Phase::new("c", "c").after(["a", "b"]),
            ],
        );
        let result = WorkflowValidator::structural().validate(&dependent);
        assert!(!result.valid);

        let ok = document(
            WorkflowPattern::Parallel,
            vec![
                Phase::new("a", "a"),
                Phase::new("b", "b"),
                Phase::new("c", "c").after(["a", "b"]),
            ],
        );
        assert!(WorkflowValidator::structural().validate(&ok).valid);
    }

    #[test]
    fn test_conditional_shape_requires_shared_merge() {
        let phases = vec![
            Phase::new("a", "analysis"),
            Phase::new("b", "b").after(["a"]).with_condition("yes"),
            Phase::new("c", "c").after(["a"]).with_condition("no"),
            Phase::new("m1", "m1").after(["b"]),
            Phase::new("m2", "m2").after(["c"]),
        ];
        let result = WorkflowValidator::structural()
            .validate(&document(WorkflowPattern::Conditional, phases));
        assert!(!result.valid);

        let phases = vec![
            Phase::new("a", "analysis"),
            Phase::new("b", "b").after(["a"]).with_condition("yes"),
            Phase::new("c", "c").after(["a"]).with_condition("no"),
            Phase::new("m", "merge").after(["b", "c"]),
        ];
        let result = WorkflowValidator::structural()
            .validate(&document(WorkflowPattern::Conditional, phases));
        assert!(result.valid, "{}", result.summary());
    }

    #[test]
    fn test_into_result() {
        let doc = document(WorkflowPattern::Sequential, vec![]);
        let err = WorkflowValidator::structural()
            .validate(&doc)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidDocument(_)));
        assert!(err.to_string().contains("no phases"));
    }
}
