//! Task Decomposer
//!
//! Turns requirement text plus a pattern hint into phases:
//!
//! - `sequential`: a chain of canonical stages found in the text
//! - `parallel`: one branch per clause, joined by an aggregation phase
//! - `conditional`: an analysis phase, one branch per alternative, a merge phase
//! - `hybrid`: planning, parallel branches, aggregation, verification
//!
//! With `auto`, an [`IntentClassifier`] picks the pattern.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::phase::{Phase, PhaseRole};
use super::workflow::WorkflowPattern;
use crate::config::DecomposerConfig;
use crate::error::{ConductorError, Result};
use crate::registry::ResourceTier;

// ============================================================================
// Intent classification boundary
// ============================================================================

/// Result of classifying requirement text
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    /// A concrete pattern (never `auto`)
    pub pattern: WorkflowPattern,

    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

/// Chooses a workflow pattern for requirement text
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, requirements: &str) -> IntentClassification;
}

/// Keyword heuristics over connective phrases
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier;

const PARALLEL_MARKERS: &[&str] = &[
    "in parallel",
    "parallel",
    "concurrently",
    "simultaneously",
    "at the same time",
    "independently",
];

const CONDITIONAL_MARKERS: &[&str] = &[
    "if ",
    "otherwise",
    "else",
    "depending on",
    "either",
    "in case",
    "unless",
];

const SEQUENTIAL_MARKERS: &[&str] = &["then", "after", "before", "finally", "first", "next"];

fn count_markers(text: &str, markers: &[&str]) -> usize {
    markers.iter().filter(|m| text.contains(*m)).count()
}

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, requirements: &str) -> IntentClassification {
        let text = format!(" {} ", requirements.to_lowercase());
        let parallel = count_markers(&text, PARALLEL_MARKERS);
        let conditional = count_markers(&text, CONDITIONAL_MARKERS);
        let sequential = words(&text)
            .filter(|w| SEQUENTIAL_MARKERS.contains(w))
            .count();

        let total = (parallel + conditional + sequential) as f64;
        if total == 0.0 {
            return IntentClassification {
                pattern: WorkflowPattern::Sequential,
                confidence: 0.4,
            };
        }

        let (pattern, hits) = if conditional > 0 && conditional >= parallel {
            (WorkflowPattern::Conditional, conditional)
        } else if parallel > 0 && sequential > 0 {
            (WorkflowPattern::Hybrid, parallel + sequential)
        } else if parallel > 0 {
            (WorkflowPattern::Parallel, parallel)
        } else {
            (WorkflowPattern::Sequential, sequential)
        };

        IntentClassification {
            pattern,
            confidence: (0.5 + 0.5 * hits as f64 / total).min(1.0),
        }
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

// ============================================================================
// Canonical stages
// ============================================================================

/// Canonical stage of a sequential chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Research,
    Design,
    Implement,
    Test,
    Review,
    Document,
    Deploy,
}

impl Stage {
    /// Word stems recognised for each stage, synonyms included
    fn stems(&self) -> &'static [&'static str] {
        match self {
            Self::Research => &["research", "analy", "investigat", "explor"],
            Self::Design => &["design", "architect", "plan"],
            Self::Implement => &["implement", "build", "develop", "code", "coding", "write", "writing"],
            Self::Test => &["test", "verif", "validat", "qa"],
            Self::Review => &["review", "audit"],
            Self::Document => &["document", "docs"],
            Self::Deploy => &["deploy", "ship", "release", "launch"],
        }
    }

    pub fn all() -> [Stage; 7] {
        [
            Self::Research,
            Self::Design,
            Self::Implement,
            Self::Test,
            Self::Review,
            Self::Document,
            Self::Deploy,
        ]
    }

    /// Stage named by a single word, if any
    pub fn from_word(word: &str) -> Option<Stage> {
        let word = word.to_lowercase();
        Self::all()
            .into_iter()
            .find(|stage| stage.stems().iter().any(|stem| stem_matches(&word, stem)))
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Research => &["research", "analysis"],
            Self::Design => &["architecture", "design"],
            Self::Implement => &["implementation", "coding"],
            Self::Test => &["testing", "quality"],
            Self::Review => &["review", "quality"],
            Self::Document => &["documentation", "writing"],
            Self::Deploy => &["deployment", "operations"],
        }
    }

    pub fn complexity(&self) -> ResourceTier {
        match self {
            Self::Implement => ResourceTier::Heavy,
            Self::Research | Self::Review | Self::Document => ResourceTier::Light,
            Self::Design | Self::Test | Self::Deploy => ResourceTier::Standard,
        }
    }

    /// Stages that do not block the workflow when they fail
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Review | Self::Document)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Design => "design",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const INFLECTIONS: &[&str] = &["", "s", "es", "ed", "er", "ers", "ing"];

/// Short stems only match inflected forms, so "plan" matches "planning" but not "planet"
fn stem_matches(word: &str, stem: &str) -> bool {
    let Some(rest) = word.strip_prefix(stem) else {
        return false;
    };
    if stem.len() > 4 {
        return true;
    }
    if INFLECTIONS.contains(&rest) {
        return true;
    }
    match (stem.chars().last(), rest.chars().next()) {
        (Some(last), Some(first)) if last == first => INFLECTIONS.contains(&&rest[first.len_utf8()..]),
        _ => false,
    }
}

/// Stages named in `text`, in order of first appearance
pub fn detect_stages(text: &str) -> Vec<Stage> {
    let mut stages = Vec::new();
    for word in words(text) {
        if let Some(stage) = Stage::from_word(word) {
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
    }
    stages
}

const DEFAULT_CHAIN: [Stage; 3] = [Stage::Design, Stage::Implement, Stage::Test];

// ============================================================================
// Clause splitting
// ============================================================================

const CLAUSE_SEPARATORS: &[&str] = &["\n", ";", ",", " and ", " & ", " plus "];
const ALTERNATIVE_SEPARATORS: &[&str] = &[" or ", " otherwise ", " else "];

fn split_on(text: &str, separators: &[&str]) -> Vec<String> {
    let mut parts = vec![text.to_string()];
    for sep in separators {
        parts = parts
            .iter()
            .flat_map(|p| p.split(sep).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }
    parts
}

fn strip_markers(clause: &str, markers: &[&str]) -> String {
    let mut cleaned = format!(" {} ", clause.to_lowercase());
    for marker in markers {
        cleaned = cleaned.replace(&format!(" {} ", marker.trim()), " ");
    }
    cleaned
        .trim_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Independent work items of a parallel request
pub fn parallel_clauses(text: &str) -> Vec<String> {
    split_on(text, CLAUSE_SEPARATORS)
        .iter()
        .map(|c| strip_markers(c, PARALLEL_MARKERS))
        .filter(|c| !c.is_empty())
        .collect()
}

/// One alternative of a conditional request
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub condition: String,
    pub action: String,
}

/// Split a conditional request into its subject and alternatives
///
/// A leading clause without a condition marker is the subject of the analysis.
pub fn conditional_alternatives(text: &str) -> (Option<String>, Vec<Alternative>) {
    let mut separators = CLAUSE_SEPARATORS.to_vec();
    separators.retain(|s| *s != " and ");
    let mut raw: Vec<String> = Vec::new();
    for clause in split_on(text, &separators) {
        let lower = format!(" {} ", clause.trim().to_lowercase());
        let mut pieces = vec![lower];
        for sep in ALTERNATIVE_SEPARATORS {
            pieces = pieces
                .iter()
                .flat_map(|p| {
                    let mut split = p.split(sep).map(str::to_string).collect::<Vec<_>>();
                    if split.len() > 1 && sep.trim() != "or" {
                        for later in split.iter_mut().skip(1) {
                            *later = format!("otherwise {}", later.trim());
                        }
                    }
                    split
                })
                .collect();
        }
        raw.extend(pieces.into_iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()));
    }

    let mut subject = None;
    if raw.len() > 2 && !has_condition_marker(&raw[0]) {
        subject = Some(strip_markers(&raw.remove(0), &[]));
    }

    let alternatives = raw
        .iter()
        .enumerate()
        .map(|(i, clause)| parse_alternative(clause, i))
        .filter(|a| !a.action.is_empty())
        .collect();

    (subject, alternatives)
}

fn has_condition_marker(clause: &str) -> bool {
    let padded = format!(" {} ", clause);
    CONDITIONAL_MARKERS
        .iter()
        .any(|m| padded.contains(&format!(" {}", m.trim_end())))
}

fn parse_alternative(clause: &str, index: usize) -> Alternative {
    let clause = clause.trim();
    let without_either = clause.strip_prefix("either ").unwrap_or(clause);

    if let Some(rest) = without_either
        .strip_prefix("otherwise")
        .or_else(|| without_either.strip_prefix("else"))
    {
        return Alternative {
            condition: "otherwise".to_string(),
            action: strip_markers(rest, &[]),
        };
    }

    for prefix in ["if ", "when ", "in case ", "unless "] {
        if let Some(rest) = without_either.strip_prefix(prefix) {
            let (condition, action) = match rest.split_once(" then ") {
                Some((c, a)) => (c, a),
                None => (rest, rest),
            };
            let condition = strip_markers(condition, &[]);
            let condition = if prefix == "unless " {
                format!("not {}", condition)
            } else {
                condition
            };
            return Alternative {
                condition,
                action: strip_markers(action, &[]),
            };
        }
    }

    Alternative {
        condition: format!("option-{}", index + 1),
        action: strip_markers(without_either, &[]),
    }
}

// ============================================================================
// Task Decomposer
// ============================================================================

/// Phases produced for a requirement, with the pattern that shaped them
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub pattern: WorkflowPattern,

    /// Classifier confidence when the pattern was inferred
    pub confidence: Option<f64>,

    pub phases: Vec<Phase>,
}

/// Splits requirement text into phases
pub struct TaskDecomposer {
    classifier: Arc<dyn IntentClassifier>,
    config: DecomposerConfig,
}

impl TaskDecomposer {
    pub fn new(config: DecomposerConfig) -> Self {
        Self::with_classifier(config, Arc::new(KeywordIntentClassifier))
    }

    pub fn with_classifier(config: DecomposerConfig, classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { classifier, config }
    }

    /// Decompose `requirements` using `hint`, classifying when the hint is `auto`
    pub fn decompose(&self, requirements: &str, hint: WorkflowPattern) -> Result<Decomposition> {
        let requirements = requirements.trim();
        if requirements.is_empty() {
            return Err(ConductorError::decomposition("requirement text is empty"));
        }

        if hint.is_concrete() {
            let phases = self.phases_for(requirements, hint)?;
            info!(pattern = %hint, phases = phases.len(), "Decomposed requirements");
            return Ok(Decomposition {
                pattern: hint,
                confidence: None,
                phases,
            });
        }

        let classification = self.classifier.classify(requirements);
        let mut pattern = classification.pattern;
        if !pattern.is_concrete() || classification.confidence < self.config.min_confidence {
            debug!(
                classified = %classification.pattern,
                confidence = classification.confidence,
                fallback = %self.config.fallback_pattern,
                "Low classifier confidence, using fallback pattern"
            );
            pattern = self.config.fallback_pattern;
        }

        let phases = match self.phases_for(requirements, pattern) {
            Ok(phases) => phases,
            Err(ConductorError::Decomposition(reason)) if pattern != WorkflowPattern::Sequential => {
                debug!(pattern = %pattern, %reason, "Inferred pattern does not fit, using sequential");
                pattern = WorkflowPattern::Sequential;
                self.phases_for(requirements, pattern)?
            }
            Err(e) => return Err(e),
        };

        info!(
            pattern = %pattern,
            confidence = classification.confidence,
            phases = phases.len(),
            "Decomposed requirements"
        );

        Ok(Decomposition {
            pattern,
            confidence: Some(classification.confidence),
            phases,
        })
    }

    fn phases_for(&self, requirements: &str, pattern: WorkflowPattern) -> Result<Vec<Phase>> {
        let phases = match pattern {
            WorkflowPattern::Sequential => sequential(requirements),
            WorkflowPattern::Parallel => parallel(requirements)?,
            WorkflowPattern::Conditional => conditional(requirements)?,
            WorkflowPattern::Hybrid => hybrid(requirements)?,
            WorkflowPattern::Auto => {
                return Err(ConductorError::decomposition("pattern must be resolved before decomposition"))
            }
        };

        if phases.is_empty() {
            return Err(ConductorError::decomposition("requirements yield no sub-tasks"));
        }
        Ok(phases)
    }
}

impl Default for TaskDecomposer {
    fn default() -> Self {
        Self::new(DecomposerConfig::default())
    }
}

// ============================================================================
// Pattern templates
// ============================================================================

struct IdSequence(usize);

impl IdSequence {
    fn next(&mut self) -> String {
        self.0 += 1;
        format!("phase-{}", self.0)
    }
}

fn stage_phase(id: String, stage: Stage, subject: &str) -> Phase {
    Phase::new(id, stage.as_str())
        .with_description(format!("{} for: {}", stage, subject))
        .with_capabilities(stage.capabilities())
        .with_complexity(stage.complexity())
        .optional(stage.is_optional())
}

fn branch_phase(id: String, clause: &str) -> Phase {
    let stage = detect_stages(clause)
        .into_iter()
        .next()
        .unwrap_or(Stage::Implement);
    Phase::new(id, clause)
        .with_description(clause)
        .with_capabilities(stage.capabilities())
        .with_complexity(stage.complexity())
        .with_role(PhaseRole::Branch)
}

fn aggregation_phase(id: String, branches: &[String], subject: &str) -> Phase {
    Phase::new(id, "aggregate")
        .with_description(format!("combine branch results for: {}", subject))
        .with_capabilities(["aggregation", "synthesis"])
        .with_complexity(ResourceTier::Standard)
        .with_role(PhaseRole::Aggregate)
        .after(branches.iter().cloned())
}

fn sequential(requirements: &str) -> Vec<Phase> {
    let mut stages = detect_stages(requirements);
    if stages.is_empty() {
        stages = DEFAULT_CHAIN.to_vec();
    }

    let mut ids = IdSequence(0);
    let mut phases: Vec<Phase> = Vec::with_capacity(stages.len());
    for stage in stages {
        let mut phase = stage_phase(ids.next(), stage, requirements);
        if let Some(previous) = phases.last() {
            phase = phase.after([previous.id.clone()]);
        }
        phases.push(phase);
    }
    phases
}

fn parallel(requirements: &str) -> Result<Vec<Phase>> {
    let clauses = parallel_clauses(requirements);
    if clauses.len() < 2 {
        return Err(ConductorError::decomposition(format!(
            "parallel pattern needs at least two independent clauses, found {}",
            clauses.len()
        )));
    }

    let mut ids = IdSequence(0);
    let branches: Vec<Phase> = clauses.iter().map(|c| branch_phase(ids.next(), c)).collect();
    let branch_ids: Vec<String> = branches.iter().map(|b| b.id.clone()).collect();

    let mut phases = branches;
    phases.push(aggregation_phase(ids.next(), &branch_ids, requirements));
    Ok(phases)
}

fn conditional(requirements: &str) -> Result<Vec<Phase>> {
    let (subject, alternatives) = conditional_alternatives(requirements);
    if alternatives.len() < 2 {
        return Err(ConductorError::decomposition(format!(
            "conditional pattern needs at least two alternatives, found {}",
            alternatives.len()
        )));
    }

    let mut ids = IdSequence(0);
    let analysis = Phase::new(ids.next(), "analysis")
        .with_description(format!(
            "decide which branch applies: {}",
            subject.as_deref().unwrap_or(requirements)
        ))
        .with_capabilities(["analysis"])
        .with_complexity(ResourceTier::Standard)
        .with_role(PhaseRole::Analysis);

    let mut branch_ids = Vec::with_capacity(alternatives.len());
    let mut phases = vec![analysis.clone()];
    for alternative in &alternatives {
        let branch = branch_phase(ids.next(), &alternative.action)
            .with_condition(alternative.condition.clone())
            .after([analysis.id.clone()]);
        branch_ids.push(branch.id.clone());
        phases.push(branch);
    }

    let merge = Phase::new(ids.next(), "merge")
        .with_description(format!("merge the selected branch for: {}", requirements))
        .with_capabilities(["aggregation", "synthesis"])
        .with_complexity(ResourceTier::Light)
        .with_role(PhaseRole::Merge)
        .after(branch_ids);
    phases.push(merge);
    Ok(phases)
}

fn hybrid(requirements: &str) -> Result<Vec<Phase>> {
    let clauses: Vec<String> = parallel_clauses(requirements)
        .into_iter()
        .map(|c| strip_markers(&c, SEQUENTIAL_MARKERS))
        .filter(|c| !c.is_empty())
        .collect();
    if clauses.len() < 2 {
        return Err(ConductorError::decomposition(format!(
            "hybrid pattern needs at least two parallel clauses, found {}",
            clauses.len()
        )));
    }

    let mut ids = IdSequence(0);
    let planning = Phase::new(ids.next(), "planning")
        .with_description(format!("plan the work for: {}", requirements))
        .with_capabilities(["planning", "architecture"])
        .with_complexity(ResourceTier::Standard);

    let mut phases = vec![planning.clone()];
    let mut branch_ids = Vec::with_capacity(clauses.len());
    for clause in &clauses {
        let branch = branch_phase(ids.next(), clause).after([planning.id.clone()]);
        branch_ids.push(branch.id.clone());
        phases.push(branch);
    }

    let aggregation = aggregation_phase(ids.next(), &branch_ids, requirements);
    let verification = stage_phase(ids.next(), Stage::Test, requirements)
        .with_description(format!("verify the combined result for: {}", requirements))
        .after([aggregation.id.clone()]);

    phases.push(aggregation);
    phases.push(verification);
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_synonyms() {
        assert_eq!(Stage::from_word("Building"), Some(Stage::Implement));
        assert_eq!(Stage::from_word("architecting"), Some(Stage::Design));
        assert_eq!(Stage::from_word("verify"), Some(Stage::Test));
        assert_eq!(Stage::from_word("ship"), Some(Stage::Deploy));
        assert_eq!(Stage::from_word("docs"), Some(Stage::Document));
        assert_eq!(Stage::from_word("login"), None);
        assert_eq!(Stage::from_word("planet"), None);
    }

    #[test]
    fn test_detect_stages_in_text_order() {
        assert_eq!(
            detect_stages("design, implement and test a login API"),
            vec![Stage::Design, Stage::Implement, Stage::Test]
        );
        assert_eq!(
            detect_stages("test then deploy, then test again"),
            vec![Stage::Test, Stage::Deploy]
        );
    }

    #[test]
    fn test_parallel_clauses() {
        let clauses = parallel_clauses("build the frontend and build the backend in parallel");
        assert_eq!(clauses, vec!["build the frontend", "build the backend"]);
    }

    #[test]
    fn test_conditional_alternatives() {
        let (subject, alternatives) = conditional_alternatives(
            "analyze the crash report; if it is a regression then fix the code, otherwise document a workaround",
        );
        assert_eq!(subject.as_deref(), Some("analyze the crash report"));
        assert_eq!(alternatives.len(), 2);
        assert_eq!(alternatives[0].condition, "it is a regression");
        assert_eq!(alternatives[0].action, "fix the code");
        assert_eq!(alternatives[1].condition, "otherwise");
        assert_eq!(alternatives[1].action, "document a workaround");
    }

    #[test]
    fn test_classifier() {
        let classifier = KeywordIntentClassifier;
        assert_eq!(
            classifier.classify("build the api and the ui in parallel").pattern,
            WorkflowPattern::Parallel
        );
        assert_eq!(
            classifier.classify("if the tests fail fix them, otherwise release").pattern,
            WorkflowPattern::Conditional
        );
        let plain = classifier.classify("a login page");
        assert_eq!(plain.pattern, WorkflowPattern::Sequential);
        assert!(plain.confidence < 0.5);
    }

    #[test]
    fn test_empty_requirements_rejected() {
        let decomposer = TaskDecomposer::default();
        assert!(matches!(
            decomposer.decompose("   ", WorkflowPattern::Sequential),
            Err(ConductorError::Decomposition(_))
        ));
    }

    #[test]
    fn test_parallel_needs_two_clauses() {
        let decomposer = TaskDecomposer::default();
        assert!(matches!(
            decomposer.decompose("build the frontend", WorkflowPattern::Parallel),
            Err(ConductorError::Decomposition(_))
        ));
    }

    #[test]
    fn test_hybrid_shape() {
        let decomposer = TaskDecomposer::default();
        let result = decomposer
            .decompose("write the parser and write the printer", WorkflowPattern::Hybrid)
            .unwrap();
        let names: Vec<&str> = result.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["planning", "write the parser", "write the printer", "aggregate", "test"]
        );
        assert!(result.phases[4].depends_on.contains("phase-4"));
    }

    #[test]
    fn test_auto_falls_back_when_unsure() {
        let decomposer = TaskDecomposer::default();
        let result = decomposer.decompose("a login page", WorkflowPattern::Auto).unwrap();
        assert_eq!(result.pattern, WorkflowPattern::Sequential);
        assert_eq!(result.phases.len(), 3);
        assert!(result.confidence.is_some());
    }
}
