//! Dependency graph analysis for phase sets

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::phase::Phase;
use crate::error::{ConductorError, Result};

/// Dependency graph over a set of phases
///
/// Iteration order follows declaration order so results are reproducible.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn from_phases<'a, I>(phases: I) -> Self
    where
        I: IntoIterator<Item = &'a Phase>,
    {
        let mut graph = Self::default();
        for phase in phases {
            graph.order.push(phase.id.clone());
            graph
                .dependencies
                .insert(phase.id.clone(), phase.depends_on.clone());
            graph.dependents.entry(phase.id.clone()).or_default();
            for dep in &phase.depends_on {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(phase.id.clone());
            }
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    /// Phase ids in declaration order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of `id`
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Direct dependents of `id` (only phases present in the graph)
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependents
            .get(id)
            .into_iter()
            .flatten()
            .filter(|d| self.contains(d))
    }

    /// `(phase, dependency)` pairs naming phases that are not in the graph
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for id in &self.order {
            for dep in self.dependencies(id) {
                if !self.contains(dep) {
                    missing.push((id.clone(), dep.clone()));
                }
            }
        }
        missing
    }

    /// First cycle found by depth-first search, as a closed path `a -> b -> a`
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();

        for id in &self.order {
            if !visited.contains(id) {
                if let Some(cycle) = self.visit(id, &mut visited, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        id: &str,
        visited: &mut BTreeSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(id.to_string());
        stack.push(id.to_string());

        for dep in self.dependencies(id).filter(|d| self.contains(d)) {
            if let Some(pos) = stack.iter().position(|s| s == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = self.visit(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    /// Kahn topological order, dependencies first, ties in declaration order
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let position: BTreeMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut in_degree: BTreeMap<&str, usize> = self
            .order
            .iter()
            .map(|id| {
                let known = self.dependencies(id).filter(|d| self.contains(d)).count();
                (id.as_str(), known)
            })
            .collect();

        let mut ready: BTreeSet<(usize, &str)> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| (position[id], id))
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        while let Some(next) = ready.pop_first() {
            let (_, id) = next;
            result.push(id.to_string());

            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((position[dependent.as_str()], dependent.as_str()));
                    }
                }
            }
        }

        if result.len() != self.order.len() {
            return Err(ConductorError::CyclicDependency {
                phases: self.find_cycle().unwrap_or_default(),
            });
        }

        Ok(result)
    }

    /// Execution levels: every phase appears one level after its deepest dependency
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self.topological_order()?;
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        for id in &order {
            let level = self
                .dependencies(id)
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id.clone());
        }

        Ok(levels)
    }

    /// All transitive dependencies of `id`
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&String> = self.dependencies(id).collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependencies(next));
            }
        }
        seen
    }

    /// Whether neither phase transitively depends on the other
    pub fn independent(&self, a: &str, b: &str) -> bool {
        a != b && !self.ancestors(a).contains(b) && !self.ancestors(b).contains(a)
    }

    /// Phases without dependencies
    pub fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).next().is_none())
            .cloned()
            .collect()
    }

    /// Phases nothing depends on
    pub fn sinks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependents(id).next().is_none())
            .cloned()
            .collect()
    }
}
