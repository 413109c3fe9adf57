//! Unit Tests for Workflow Planning and Validation
//!
//! Drives the decomposer, matcher, generator and validator through the
//! orchestrator, plus property tests over random dependency graphs.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use common::*;
use conductor::orchestration::{
    output_key_for, CreateOutcome, CreateWorkflowRequest, DependencyGraph, EchoExecutor, Phase,
    PhaseRole, ValidationError, ValidationWarning, WorkflowDocument, WorkflowPattern,
    WorkflowValidator,
};
use conductor::registry::{CapabilityRegistry, ResourceTier, WorkerDescriptor};
use conductor::Orchestrator;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(test_config(), sample_registry(), Arc::new(EchoExecutor))
}

fn created(outcome: CreateOutcome) -> WorkflowDocument {
    match outcome {
        CreateOutcome::Created { document } => document,
        CreateOutcome::Rejected { validation } => panic!("rejected: {}", validation.summary()),
    }
}

fn deps(document: &WorkflowDocument, phase_id: &str) -> BTreeSet<String> {
    document.phase(phase_id).unwrap().phase.depends_on.iter().cloned().collect()
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_sequential_login_api() {
    let orchestrator = orchestrator();
    let request = CreateWorkflowRequest::new("design, implement and test a login API").with_pattern("sequential");

    let document = created(orchestrator.create_workflow(&request).unwrap());

    assert_eq!(document.pattern(), WorkflowPattern::Sequential);
    assert_eq!(document.phases().len(), 3);
    assert_eq!(document.phase("phase-1").unwrap().worker_id, "architect");
    assert_eq!(document.phase("phase-2").unwrap().worker_id, "coder");
    assert_eq!(document.phase("phase-3").unwrap().worker_id, "tester");

    assert!(deps(&document, "phase-1").is_empty());
    assert_eq!(deps(&document, "phase-2"), set(&["phase-1"]));
    assert_eq!(deps(&document, "phase-3"), set(&["phase-2"]));

    // Each phase reads its predecessor's output
    let implement = &document.phase("phase-2").unwrap().phase;
    assert_eq!(implement.input_context_keys, vec![output_key_for("phase-1")]);

    assert!(document.fallbacks_for("phase-2").contains(&"backup-coder".to_string()));
    assert_eq!(document.version(), 1);
}

#[test]
fn test_parallel_branches_converge() {
    let orchestrator = orchestrator();
    let request = CreateWorkflowRequest::new("build the frontend and build the backend").with_pattern("parallel");

    let document = created(orchestrator.create_workflow(&request).unwrap());

    assert_eq!(document.pattern(), WorkflowPattern::Parallel);
    assert_eq!(document.phases().len(), 3);
    assert_eq!(deps(&document, "phase-3"), set(&["phase-1", "phase-2"]));
    assert!(deps(&document, "phase-1").is_empty());
    assert!(deps(&document, "phase-2").is_empty());

    let aggregate = document.phase("phase-3").unwrap();
    assert_eq!(aggregate.phase.role, PhaseRole::Aggregate);
    assert_eq!(aggregate.worker_id, "integrator");
}

#[test]
fn test_conditional_request() {
    let orchestrator = orchestrator();
    let request = CreateWorkflowRequest::new(
        "check the failing build; if it is a regression then revert the change; otherwise fix the test",
    )
    .with_pattern("conditional");

    let document = created(orchestrator.create_workflow(&request).unwrap());

    assert_eq!(document.phases().len(), 4);
    assert_eq!(document.phase("phase-1").unwrap().phase.role, PhaseRole::Analysis);
    assert_eq!(document.phase("phase-1").unwrap().worker_id, "analyst");
    assert_eq!(
        document.phase("phase-2").unwrap().phase.condition.as_deref(),
        Some("it is a regression")
    );
    assert_eq!(
        document.phase("phase-3").unwrap().phase.condition.as_deref(),
        Some("otherwise")
    );
    assert_eq!(deps(&document, "phase-4"), set(&["phase-2", "phase-3"]));

    let groups = document.conditional_groups();
    assert_eq!(groups["phase-1"], vec!["phase-2", "phase-3"]);
}

#[test]
fn test_hybrid_request() {
    let orchestrator = orchestrator();
    let request = CreateWorkflowRequest::new("plan the work first, then build the api and build the ui in parallel")
        .with_pattern("hybrid");

    let document = created(orchestrator.create_workflow(&request).unwrap());
    let graph = DependencyGraph::from_phases(document.phases().iter().map(|b| &b.phase));

    assert_eq!(document.phases().len(), 6);
    assert_eq!(graph.roots(), vec!["phase-1"]);
    assert_eq!(graph.sinks(), vec!["phase-6"]);
    assert_eq!(deps(&document, "phase-6"), set(&["phase-5"]));
    assert_eq!(deps(&document, "phase-5"), set(&["phase-2", "phase-3", "phase-4"]));
}

#[test]
fn test_auto_pattern_is_classified() {
    let orchestrator = orchestrator();
    let request = CreateWorkflowRequest::new("build the api and build the ui in parallel");

    let document = created(orchestrator.create_workflow(&request).unwrap());
    assert_eq!(document.pattern(), WorkflowPattern::Parallel);
}

#[test]
fn test_cycle_is_reported() {
    let document = document(
        WorkflowPattern::Sequential,
        vec![
            bound(Phase::new("A", "first").after(["B"]), "architect"),
            bound(Phase::new("B", "second").after(["A"]), "coder"),
        ],
    );

    let result = orchestrator().validate(&document);

    assert!(!result.valid);
    assert!(result.has_cycle());
    let cycle = result
        .errors
        .iter()
        .find_map(|e| match e {
            ValidationError::CyclicDependency { phases } => Some(phases.clone()),
            _ => None,
        })
        .unwrap();
    assert!(cycle.contains(&"A".to_string()));
    assert!(cycle.contains(&"B".to_string()));
}

#[test]
fn test_unknown_worker_is_reported() {
    let document = document(
        WorkflowPattern::Sequential,
        vec![bound(Phase::new("phase-1", "design"), "nobody")],
    );

    let result = orchestrator().validate(&document);
    assert!(result.errors.contains(&ValidationError::WorkerNotFound {
        phase_id: "phase-1".into(),
        worker_id: "nobody".into(),
    }));
}

#[test]
fn test_conflicting_workers_warn() {
    let registry = Arc::new(
        CapabilityRegistry::from_descriptors([
            WorkerDescriptor::new("architect", ["architecture"], ResourceTier::Standard),
            WorkerDescriptor::new("coder", ["implementation"], ResourceTier::Heavy).with_conflicts(["architect"]),
        ])
        .unwrap(),
    );
    let document = document(
        WorkflowPattern::Sequential,
        vec![
            bound(Phase::new("phase-1", "design"), "architect"),
            bound(Phase::new("phase-2", "implement").after(["phase-1"]), "coder"),
        ],
    );

    let result = WorkflowValidator::new(registry).validate(&document);

    assert!(result.valid);
    assert!(result.warnings.contains(&ValidationWarning::WorkerConflict {
        phase_id: "phase-2".into(),
        worker_id: "coder".into(),
        dependency_id: "phase-1".into(),
        conflicting_worker: "architect".into(),
    }));
}

#[test]
fn test_shape_mismatch_is_reported() {
    let mut phases = sequential_chain().phases().to_vec();
    phases[2].phase.depends_on.clear();
    phases[2].phase.input_context_keys.clear();
    let document = document(WorkflowPattern::Sequential, phases);

    let result = orchestrator().validate(&document);
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, ValidationError::PatternShape { .. })));
}

#[test]
fn test_validation_is_idempotent() {
    let orchestrator = orchestrator();
    let document = orchestrator
        .plan("research, design and implement a cache", WorkflowPattern::Sequential)
        .unwrap();

    let first = orchestrator.validate(&document);
    let second = orchestrator.validate(&document);

    assert!(first.valid);
    assert_eq!(first, second);
}

#[test]
fn test_document_survives_serialization() {
    let orchestrator = orchestrator();
    for (text, pattern) in [
        ("design, implement and test a login API", WorkflowPattern::Sequential),
        ("build the frontend and build the backend", WorkflowPattern::Parallel),
    ] {
        let document = orchestrator.plan(text, pattern).unwrap();

        let restored = WorkflowDocument::from_json(&document.to_json().unwrap()).unwrap();
        assert_eq!(restored, document);
        assert_eq!(orchestrator.validate(&restored), orchestrator.validate(&document));
    }
}

#[test]
fn test_refine_keeps_lineage() {
    let orchestrator = orchestrator();
    let first = created(
        orchestrator
            .create_workflow(&CreateWorkflowRequest::new("design and implement a cache").with_pattern("sequential"))
            .unwrap(),
    );

    let second = created(
        orchestrator
            .refine_workflow(&first, "design, implement and review a cache")
            .unwrap(),
    );

    assert_eq!(second.id(), first.id());
    assert_eq!(second.version(), first.version() + 1);
    assert_eq!(second.derived_from(), Some(first.revision().as_str()));
    assert_eq!(second.pattern(), first.pattern());
    assert!(second.phases().len() > first.phases().len());
}

// ============================================================================
// Property tests
// ============================================================================

/// `n` phases where phase `i` may depend on any phase, itself included
fn arb_graph() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..8).prop_flat_map(|n| prop::collection::vec(prop::collection::vec(0..n, 0..3), n))
}

/// `n` phases depending only on earlier phases, each reading up to two output keys
fn arb_dag_with_inputs() -> impl Strategy<Value = Vec<(Vec<usize>, Vec<usize>)>> {
    (1usize..8).prop_flat_map(|n| {
        prop::collection::vec(
            (prop::collection::vec(0..n, 0..3), prop::collection::vec(0..n, 0..2)),
            n,
        )
    })
    .prop_map(|phases| {
        phases
            .into_iter()
            .enumerate()
            .map(|(i, (deps, inputs))| (deps.into_iter().filter(|d| *d < i).collect(), inputs))
            .collect()
    })
}

fn id(i: usize) -> String {
    format!("p{}", i)
}

fn graph_document(phases: Vec<Phase>) -> WorkflowDocument {
    document(
        WorkflowPattern::Sequential,
        phases.into_iter().map(|p| bound(p, "generalist")).collect(),
    )
}

proptest! {
    #[test]
    fn prop_acyclic_documents_have_a_topological_order(graph in arb_graph()) {
        let phases: Vec<Phase> = graph
            .iter()
            .enumerate()
            .map(|(i, deps)| Phase::new(id(i), id(i)).after(deps.iter().map(|d| id(*d))))
            .collect();
        let document = graph_document(phases);

        let result = WorkflowValidator::structural().validate(&document);
        let dag = DependencyGraph::from_phases(document.phases().iter().map(|b| &b.phase));
        let order = dag.topological_order();

        prop_assert_eq!(result.has_cycle(), order.is_err());
        if let Ok(order) = order {
            prop_assert_eq!(order.len(), document.phases().len());
            for (position, phase_id) in order.iter().enumerate() {
                for dependency in dag.dependencies(phase_id) {
                    let before = order.iter().position(|p| p == dependency).unwrap();
                    prop_assert!(before < position);
                }
            }
        }
    }

    #[test]
    fn prop_context_references_resolve_to_ancestors(graph in arb_dag_with_inputs()) {
        let phases: Vec<Phase> = graph
            .iter()
            .enumerate()
            .map(|(i, (deps, inputs))| {
                Phase::new(id(i), id(i))
                    .after(deps.iter().map(|d| id(*d)))
                    .with_inputs(inputs.iter().map(|k| output_key_for(&id(*k))))
            })
            .collect();
        let document = graph_document(phases);

        let result = WorkflowValidator::structural().validate(&document);
        let dag = DependencyGraph::from_phases(document.phases().iter().map(|b| &b.phase));

        let unresolved = document.phases().iter().any(|bound| {
            let ancestors = dag.ancestors(&bound.phase.id);
            bound.phase.input_context_keys.iter().any(|key| {
                !ancestors.iter().any(|a| &output_key_for(a) == key)
            })
        });
        let reported = result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::DanglingContextReference { .. }));

        prop_assert_eq!(unresolved, reported);
        prop_assert!(!result.has_cycle());
    }
}
