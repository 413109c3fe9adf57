//! Workflow documents and persisted records

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;
use super::state::ExecutionState;
use crate::context::ContextEntry;
use crate::error::Result;

/// Concurrency shape of a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPattern {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Hybrid,

    /// Let the intent classifier choose
    Auto,
}

impl WorkflowPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::Hybrid => "hybrid",
            Self::Auto => "auto",
        }
    }

    /// Whether the pattern names an actual shape (everything but `auto`)
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for WorkflowPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowPattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "conditional" => Ok(Self::Conditional),
            "hybrid" => Ok(Self::Hybrid),
            "auto" | "" => Ok(Self::Auto),
            other => Err(format!(
                "Invalid workflow pattern '{}'. Must be one of: sequential, parallel, conditional, hybrid, auto",
                other
            )),
        }
    }
}

/// A phase bound to exactly one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundPhase {
    pub phase: Phase,
    pub worker_id: String,
}

/// Executable workflow: bound phases, pattern and fallback workers
///
/// Documents are immutable. [`WorkflowDocument::refine`] yields a successor
/// with the same id and the next version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    id: Uuid,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    derived_from: Option<String>,
    requirements: String,
    pattern: WorkflowPattern,
    phases: Vec<BoundPhase>,
    #[serde(default)]
    fallbacks: BTreeMap<String, Vec<String>>,
    created_at: DateTime<Utc>,
}

impl WorkflowDocument {
    /// Assemble a document without structural checks
    ///
    /// The generator is the checked path. This constructor exists for loading
    /// hand-written documents, which then go through the validator.
    pub fn new(
        requirements: impl Into<String>,
        pattern: WorkflowPattern,
        phases: Vec<BoundPhase>,
        fallbacks: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            derived_from: None,
            requirements: requirements.into(),
            pattern,
            phases,
            fallbacks,
            created_at: Utc::now(),
        }
    }

    /// Successor document carrying new phases and fallbacks
    pub fn refine(
        &self,
        requirements: impl Into<String>,
        phases: Vec<BoundPhase>,
        fallbacks: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            derived_from: Some(self.revision()),
            requirements: requirements.into(),
            pattern: self.pattern,
            phases,
            fallbacks,
            created_at: Utc::now(),
        }
    }

    /// Successor document with one phase bound to a different worker
    ///
    /// The previous binding is moved to the front of the fallback list.
    pub fn rebind(&self, phase_id: &str, worker_id: impl Into<String>) -> Option<Self> {
        let worker_id = worker_id.into();
        let mut phases = self.phases.clone();
        let bound = phases.iter_mut().find(|b| b.phase.id == phase_id)?;
        let previous = std::mem::replace(&mut bound.worker_id, worker_id.clone());

        let mut fallbacks = self.fallbacks.clone();
        let list = fallbacks.entry(phase_id.to_string()).or_default();
        list.retain(|w| w != &worker_id && w != &previous);
        list.insert(0, previous);

        Some(self.refine(self.requirements.clone(), phases, fallbacks))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `id@version`
    pub fn revision(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    pub fn derived_from(&self) -> Option<&str> {
        self.derived_from.as_deref()
    }

    pub fn requirements(&self) -> &str {
        &self.requirements
    }

    pub fn pattern(&self) -> WorkflowPattern {
        self.pattern
    }

    pub fn phases(&self) -> &[BoundPhase] {
        &self.phases
    }

    pub fn phase(&self, id: &str) -> Option<&BoundPhase> {
        self.phases.iter().find(|b| b.phase.id == id)
    }

    pub fn fallbacks(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fallbacks
    }

    pub fn fallbacks_for(&self, phase_id: &str) -> &[String] {
        self.fallbacks
            .get(phase_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Bound worker followed by fallbacks, in the order attempts use them
    pub fn candidates(&self, phase_id: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(bound) = self.phase(phase_id) {
            candidates.push(bound.worker_id.clone());
        }
        for worker in self.fallbacks_for(phase_id) {
            if !candidates.contains(worker) {
                candidates.push(worker.clone());
            }
        }
        candidates
    }

    /// Analysis phase id -> the conditional branches that depend on it
    ///
    /// A branch is a phase with a `condition` label and exactly one dependency.
    pub fn conditional_groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for bound in &self.phases {
            let phase = &bound.phase;
            if phase.condition.is_none() || phase.depends_on.len() != 1 {
                continue;
            }
            if let Some(analysis) = phase.depends_on.first() {
                groups
                    .entry(analysis.clone())
                    .or_default()
                    .push(phase.id.clone());
            }
        }
        groups
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Read a document from a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            _ => Self::from_json(&content),
        }
    }
}

/// Self-describing record of a document and its run, sufficient to audit or resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub schema_version: u32,
    pub document: WorkflowDocument,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExecutionState>,

    /// Context entries alive when the record was taken
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    pub recorded_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new(
        document: WorkflowDocument,
        state: Option<ExecutionState>,
        context: Vec<ContextEntry>,
    ) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            document,
            state,
            context,
            recorded_at: Utc::now(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> WorkflowDocument {
        let phases = vec![
            BoundPhase {
                phase: Phase::new("phase-1", "design"),
                worker_id: "architect".into(),
            },
            BoundPhase {
                phase: Phase::new("phase-2", "implement").after(["phase-1"]),
                worker_id: "coder".into(),
            },
        ];
        let fallbacks = BTreeMap::from([("phase-2".to_string(), vec!["helper".to_string()])]);
        WorkflowDocument::new("build it", WorkflowPattern::Sequential, phases, fallbacks)
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!("Parallel".parse::<WorkflowPattern>().unwrap(), WorkflowPattern::Parallel);
        assert_eq!("".parse::<WorkflowPattern>().unwrap(), WorkflowPattern::Auto);
        assert!("mesh".parse::<WorkflowPattern>().is_err());
    }

    #[test]
    fn test_candidates_order() {
        let doc = document();
        assert_eq!(doc.candidates("phase-2"), vec!["coder", "helper"]);
        assert_eq!(doc.candidates("phase-1"), vec!["architect"]);
        assert!(doc.candidates("missing").is_empty());
    }

    #[test]
    fn test_rebind_creates_new_version() {
        let doc = document();
        let next = doc.rebind("phase-2", "helper").unwrap();

        assert_eq!(next.id(), doc.id());
        assert_eq!(next.version(), 2);
        assert_eq!(next.derived_from(), Some(doc.revision().as_str()));
        assert_eq!(next.phase("phase-2").unwrap().worker_id, "helper");
        assert_eq!(next.fallbacks_for("phase-2"), ["coder".to_string()]);
        assert_eq!(doc.phase("phase-2").unwrap().worker_id, "coder");
        assert!(doc.rebind("phase-9", "x").is_none());
    }

    #[test]
    fn test_yaml_round_trip() {
        let doc = document();
        let yaml = doc.to_yaml().unwrap();
        let back: WorkflowDocument = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, doc);
    }
}
