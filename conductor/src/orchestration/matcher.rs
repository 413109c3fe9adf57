//! Worker Matcher
//!
//! Ranks registry workers against a phase. The score combines three parts:
//!
//! - exact capability overlap, with the primary capability counted twice
//! - semantic similarity from a pluggable [`SimilarityScorer`]
//! - resource-tier fit between the phase complexity and the worker tier
//!
//! Ranking is deterministic: score, then overlap count, then worker id.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::phase::Phase;
use crate::config::MatcherConfig;
use crate::error::{ConductorError, Result};
use crate::registry::{CapabilityRegistry, WorkerDescriptor};

// ============================================================================
// Semantic similarity boundary
// ============================================================================

/// Text similarity in `[0, 1]`
pub trait SimilarityScorer: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard similarity over word tokens
///
/// Tokens sharing a prefix of at least four characters count as equal, so
/// "testing" and "tests" match.
#[derive(Debug, Clone, Default)]
pub struct TokenOverlapSimilarity;

const MIN_SHARED_PREFIX: usize = 4;

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn tokens_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    shared >= MIN_SHARED_PREFIX
}

impl SimilarityScorer for TokenOverlapSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let left = tokens(a);
        let right = tokens(b);
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }

        let matched = left
            .iter()
            .filter(|l| right.iter().any(|r| tokens_match(l, r)))
            .count();
        let union = left.len() + right.len() - matched;
        matched as f64 / union as f64
    }
}

// ============================================================================
// Matches
// ============================================================================

/// A scored candidate worker for a phase
#[derive(Debug, Clone)]
pub struct WorkerMatch {
    pub worker: Arc<WorkerDescriptor>,

    /// Weighted total in `[0, 1]`
    pub score: f64,

    /// Number of required capabilities the worker carries exactly
    pub overlap: usize,

    pub overlap_score: f64,
    pub semantic_score: f64,
    pub tier_fit: f64,

    /// Chosen as the general-purpose default because nothing else qualified
    pub is_default: bool,
}

impl WorkerMatch {
    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }

    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.overlap.cmp(&self.overlap))
            .then_with(|| self.worker.id.cmp(&other.worker.id))
    }
}

// ============================================================================
// Worker Matcher
// ============================================================================

/// Ranks registry workers against phases
pub struct WorkerMatcher {
    registry: Arc<CapabilityRegistry>,
    scorer: Arc<dyn SimilarityScorer>,
    config: MatcherConfig,
}

impl WorkerMatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, config: MatcherConfig) -> Self {
        Self::with_scorer(registry, config, Arc::new(TokenOverlapSimilarity))
    }

    pub fn with_scorer(
        registry: Arc<CapabilityRegistry>,
        config: MatcherConfig,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            registry,
            scorer,
            config,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Score one worker against a phase
    pub fn score(&self, phase: &Phase, worker: &Arc<WorkerDescriptor>) -> WorkerMatch {
        let required = &phase.required_capabilities;

        let mut total_weight = 0.0;
        let mut matched_weight = 0.0;
        let mut overlap = 0;
        let mut semantic_sum = 0.0;

        for (i, capability) in required.iter().enumerate() {
            let weight = if i == 0 { 2.0 } else { 1.0 };
            total_weight += weight;
            if worker.has_capability(capability) {
                matched_weight += weight;
                overlap += 1;
            }

            let best = worker
                .capabilities
                .iter()
                .map(|c| self.scorer.similarity(capability, c))
                .chain(
                    worker
                        .description
                        .as_deref()
                        .map(|d| self.scorer.similarity(capability, d)),
                )
                .fold(0.0_f64, f64::max);
            semantic_sum += best.clamp(0.0, 1.0);
        }

        let (overlap_score, semantic_score) = if required.is_empty() {
            (0.0, 0.0)
        } else {
            (matched_weight / total_weight, semantic_sum / required.len() as f64)
        };
        let tier_fit = 1.0 - 0.5 * f64::from(phase.complexity.distance(worker.resource_tier));

        let weights = self.config.overlap_weight + self.config.semantic_weight + self.config.tier_weight;
        let score = if weights > 0.0 {
            (self.config.overlap_weight * overlap_score
                + self.config.semantic_weight * semantic_score
                + self.config.tier_weight * tier_fit)
                / weights
        } else {
            0.0
        };

        WorkerMatch {
            worker: Arc::clone(worker),
            score,
            overlap,
            overlap_score,
            semantic_score,
            tier_fit,
            is_default: false,
        }
    }

    /// All workers scoring at least `min_score`, best first
    pub fn rank(&self, phase: &Phase) -> Vec<WorkerMatch> {
        let mut matches: Vec<WorkerMatch> = self
            .registry
            .all()
            .iter()
            .map(|worker| self.score(phase, worker))
            .filter(|m| m.score >= self.config.min_score)
            .collect();
        matches.sort_by(WorkerMatch::rank_cmp);
        matches
    }

    /// Ranked matches for a phase, falling back to the general-purpose worker
    ///
    /// Fails with `NoMatch` when nothing qualifies and no general worker exists.
    pub fn match_phase(&self, phase: &Phase) -> Result<Vec<WorkerMatch>> {
        let matches = self.rank(phase);
        if let Some(best) = matches.first() {
            debug!(
                phase = %phase.id,
                worker = %best.worker.id,
                score = best.score,
                candidates = matches.len(),
                "Matched phase"
            );
            return Ok(matches);
        }

        match self.registry.default_worker() {
            Some(worker) => {
                warn!(
                    phase = %phase.id,
                    worker = %worker.id,
                    "No worker above threshold, using general-purpose default"
                );
                let mut fallback = self.score(phase, &worker);
                fallback.is_default = true;
                Ok(vec![fallback])
            }
            None => Err(ConductorError::NoMatch {
                phase_id: phase.id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceTier;

    fn matcher(workers: Vec<WorkerDescriptor>) -> WorkerMatcher {
        let registry = Arc::new(CapabilityRegistry::from_descriptors(workers).unwrap());
        WorkerMatcher::new(registry, MatcherConfig::default())
    }

    fn design_phase() -> Phase {
        Phase::new("phase-1", "design")
            .with_capabilities(["architecture", "design"])
            .with_complexity(ResourceTier::Standard)
    }

    #[test]
    fn test_similarity() {
        let scorer = TokenOverlapSimilarity;
        assert_eq!(scorer.similarity("testing", "testing"), 1.0);
        assert_eq!(scorer.similarity("testing", "tests"), 1.0);
        assert_eq!(scorer.similarity("design", "deployment"), 0.0);
        assert_eq!(scorer.similarity("", "x"), 0.0);
    }

    #[test]
    fn test_exact_overlap_wins() {
        let matcher = matcher(vec![
            WorkerDescriptor::new("architect", ["architecture", "design"], ResourceTier::Standard),
            WorkerDescriptor::new("coder", ["implementation"], ResourceTier::Standard),
        ]);
        let ranked = matcher.rank(&design_phase());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].worker_id(), "architect");
        assert_eq!(ranked[0].overlap, 2);
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_primary_capability_weighs_more() {
        let matcher = matcher(vec![
            WorkerDescriptor::new("a-secondary", ["design"], ResourceTier::Standard),
            WorkerDescriptor::new("b-primary", ["architecture"], ResourceTier::Standard),
        ]);
        let ranked = matcher.rank(&design_phase());
        assert_eq!(ranked[0].worker_id(), "b-primary");
    }

    #[test]
    fn test_ties_broken_by_id() {
        let matcher = matcher(vec![
            WorkerDescriptor::new("zeta", ["architecture", "design"], ResourceTier::Standard),
            WorkerDescriptor::new("alpha", ["architecture", "design"], ResourceTier::Standard),
        ]);
        let ranked = matcher.rank(&design_phase());
        let ids: Vec<&str> = ranked.iter().map(WorkerMatch::worker_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_tier_mismatch_penalized() {
        let matcher = matcher(vec![
            WorkerDescriptor::new("light", ["architecture", "design"], ResourceTier::Light),
            WorkerDescriptor::new("heavy", ["architecture", "design"], ResourceTier::Heavy),
            WorkerDescriptor::new("standard", ["architecture", "design"], ResourceTier::Standard),
        ]);
        let ranked = matcher.rank(&design_phase());
        assert_eq!(ranked[0].worker_id(), "standard");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_default_worker_fallback() {
        let matcher = matcher(vec![
            WorkerDescriptor::new("coder", ["implementation"], ResourceTier::Heavy),
            WorkerDescriptor::new("generalist", ["general"], ResourceTier::Standard),
        ]);
        let matches = matcher.match_phase(&design_phase()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].worker_id(), "generalist");
        assert!(matches[0].is_default);
    }

    #[test]
    fn test_no_match() {
        let matcher = matcher(vec![WorkerDescriptor::new(
            "coder",
            ["implementation"],
            ResourceTier::Heavy,
        )]);
        assert!(matches!(
            matcher.match_phase(&design_phase()),
            Err(ConductorError::NoMatch { phase_id }) if phase_id == "phase-1"
        ));
    }
}
