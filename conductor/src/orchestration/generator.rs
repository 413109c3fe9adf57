//! Workflow Generator
//!
//! Binds each phase to its best match and records the runners-up as fallbacks.
//! Structural defects are rejected here, before a document exists.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info};

use super::dag::DependencyGraph;
use super::matcher::WorkerMatch;
use super::phase::Phase;
use super::workflow::{BoundPhase, WorkflowDocument, WorkflowPattern};
use crate::error::{ConductorError, Result};

/// `(phase, key)` pairs where a phase reads a key none of its transitive
/// dependencies produce
pub fn dangling_references<'a, I>(phases: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a Phase>,
{
    let phases: Vec<&Phase> = phases.into_iter().collect();
    let graph = DependencyGraph::from_phases(phases.iter().copied());
    let outputs: HashMap<&str, &str> = phases
        .iter()
        .map(|p| (p.id.as_str(), p.output_context_key.as_str()))
        .collect();

    let mut dangling = Vec::new();
    for phase in &phases {
        let producible: BTreeSet<&str> = graph
            .ancestors(&phase.id)
            .iter()
            .filter_map(|id| outputs.get(id.as_str()).copied())
            .collect();

        for key in &phase.input_context_keys {
            if !producible.contains(key.as_str()) {
                dangling.push((phase.id.clone(), key.clone()));
            }
        }
    }
    dangling
}

/// Output keys declared by more than one phase, with their producers
pub fn duplicate_output_keys<'a, I>(phases: I) -> Vec<(String, Vec<String>)>
where
    I: IntoIterator<Item = &'a Phase>,
{
    let mut producers: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for phase in phases {
        producers
            .entry(phase.output_context_key.as_str())
            .or_default()
            .push(phase.id.clone());
    }
    producers
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(key, ids)| (key.to_string(), ids))
        .collect()
}

/// Reject phase sets that cannot form a valid document
///
/// Checks, in order: unknown dependencies, duplicate phase ids or output keys,
/// cycles, dangling context references.
pub fn check_structure(phases: &[Phase]) -> Result<()> {
    let graph = DependencyGraph::from_phases(phases);

    if let Some((phase_id, dependency_id)) = graph.missing_dependencies().into_iter().next() {
        return Err(ConductorError::MissingDependency {
            phase_id,
            dependency_id,
        });
    }

    let mut seen = BTreeSet::new();
    for phase in phases {
        if !seen.insert(phase.id.as_str()) {
            return Err(ConductorError::DuplicatePhase {
                phase_id: phase.id.clone(),
            });
        }
    }

    if let Some((key, phases)) = duplicate_output_keys(phases).into_iter().next() {
        return Err(ConductorError::DuplicateOutputKey { key, phases });
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(ConductorError::CyclicDependency { phases: cycle });
    }

    if let Some((phase_id, key)) = dangling_references(phases).into_iter().next() {
        return Err(ConductorError::DanglingContextReference { phase_id, key });
    }

    Ok(())
}

/// Assembles workflow documents from phases and ranked matches
#[derive(Debug, Clone)]
pub struct WorkflowGenerator {
    fallback_count: usize,
}

impl WorkflowGenerator {
    pub fn new(fallback_count: usize) -> Self {
        Self { fallback_count }
    }

    /// Build a document binding every phase to its top-ranked match
    ///
    /// `matches` maps phase id to a ranked list; a phase without matches fails
    /// with `NoMatch`.
    pub fn generate(
        &self,
        requirements: &str,
        phases: Vec<Phase>,
        matches: &HashMap<String, Vec<WorkerMatch>>,
        pattern: WorkflowPattern,
    ) -> Result<WorkflowDocument> {
        check_structure(&phases)?;

        let mut bound = Vec::with_capacity(phases.len());
        let mut fallbacks = BTreeMap::new();

        for phase in phases {
            let ranked = matches
                .get(&phase.id)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| ConductorError::NoMatch {
                    phase_id: phase.id.clone(),
                })?;

            let worker_id = ranked[0].worker.id.clone();
            let alternates: Vec<String> = ranked
                .iter()
                .skip(1)
                .map(|m| m.worker.id.clone())
                .filter(|id| id != &worker_id)
                .take(self.fallback_count)
                .collect();

            debug!(
                phase = %phase.id,
                worker = %worker_id,
                fallbacks = alternates.len(),
                "Bound phase"
            );

            if !alternates.is_empty() {
                fallbacks.insert(phase.id.clone(), alternates);
            }
            bound.push(BoundPhase { phase, worker_id });
        }

        let document = WorkflowDocument::new(requirements, pattern, bound, fallbacks);
        info!(
            workflow = %document.id(),
            pattern = %pattern,
            phases = document.phases().len(),
            "Generated workflow document"
        );
        Ok(document)
    }
}

impl Default for WorkflowGenerator {
    fn default() -> Self {
        Self::new(2)
    }
}
