//! Phases and their lifecycle

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::{normalize_tag, ResourceTier};

/// Context key a phase publishes its output under
pub fn output_key_for(phase_id: &str) -> String {
    format!("{}.output", phase_id)
}

/// Structural role of a phase inside its pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRole {
    /// Step of a linear chain (also planning and verification steps)
    #[default]
    Stage,

    /// Independent branch of a parallel group, or a conditional alternative
    Branch,

    /// Joins parallel branches
    Aggregate,

    /// Decides which conditional branch runs
    Analysis,

    /// Joins conditional branches
    Merge,
}

/// One unit of orchestrated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, alias = "dependsOn")]
    pub depends_on: BTreeSet<String>,

    /// Ordered, first entry is the primary capability
    #[serde(default, alias = "requiredCapabilities")]
    pub required_capabilities: Vec<String>,

    #[serde(default, alias = "inputContextKeys")]
    pub input_context_keys: Vec<String>,

    #[serde(alias = "outputContextKey")]
    pub output_context_key: String,

    /// Declared complexity, compared against worker tiers
    #[serde(default)]
    pub complexity: ResourceTier,

    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub role: PhaseRole,

    /// Branch label for conditional alternatives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Phase {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            output_context_key: output_key_for(&id),
            id,
            name: name.into(),
            description: String::new(),
            depends_on: BTreeSet::new(),
            required_capabilities: Vec::new(),
            input_context_keys: Vec::new(),
            complexity: ResourceTier::Standard,
            optional: false,
            role: PhaseRole::Stage,
            condition: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Depend on `phase_ids` and consume their default output keys
    pub fn after<I, S>(mut self, phase_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in phase_ids {
            let id = id.into();
            let key = output_key_for(&id);
            if !self.input_context_keys.contains(&key) {
                self.input_context_keys.push(key);
            }
            self.depends_on.insert(id);
        }
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.required_capabilities = capabilities
            .into_iter()
            .map(|c| normalize_tag(c.as_ref()))
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_context_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_context_key = key.into();
        self
    }

    pub fn with_complexity(mut self, complexity: ResourceTier) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_role(mut self, role: PhaseRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn primary_capability(&self) -> Option<&str> {
        self.required_capabilities.first().map(String::as_str)
    }
}

/// Status of a phase inside one execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Legal transitions of the phase state machine
    ///
    /// `Failed -> Running` is a retry; `Pending -> Skipped` covers cancellation,
    /// unselected branches and aborted runs.
    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
                | (Failed, Running)
                | (Failed, Skipped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a phase was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A conditional analysis phase selected a sibling branch
    BranchNotTaken { selected: String },

    /// A dependency failed or was skipped and cannot satisfy this phase
    UpstreamUnavailable { dependency: String },

    /// A required phase failed and the run stopped dispatching
    WorkflowFailed,

    Cancelled,
}

impl SkipReason {
    pub fn is_branch_not_taken(&self) -> bool {
        matches!(self, Self::BranchNotTaken { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BranchNotTaken { selected } => write!(f, "branch not taken ({} selected)", selected),
            Self::UpstreamUnavailable { dependency } => {
                write!(f, "dependency {} did not succeed", dependency)
            }
            Self::WorkflowFailed => f.write_str("workflow failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_wires_inputs() {
        let phase = Phase::new("phase-3", "aggregate").after(["phase-1", "phase-2"]);
        assert_eq!(phase.depends_on.len(), 2);
        assert_eq!(
            phase.input_context_keys,
            vec!["phase-1.output".to_string(), "phase-2.output".to_string()]
        );
        assert_eq!(phase.output_context_key, "phase-3.output");
    }

    #[test]
    fn test_status_transitions() {
        assert!(PhaseStatus::Pending.can_transition_to(PhaseStatus::Running));
        assert!(PhaseStatus::Failed.can_transition_to(PhaseStatus::Running));
        assert!(!PhaseStatus::Succeeded.can_transition_to(PhaseStatus::Running));
        assert!(!PhaseStatus::Pending.can_transition_to(PhaseStatus::Succeeded));
        assert!(!PhaseStatus::Skipped.can_transition_to(PhaseStatus::Running));
    }

    #[test]
    fn test_phase_accepts_camel_case() {
        let json = r#"{"id":"a","name":"a","dependsOn":["b"],"outputContextKey":"a.out"}"#;
        let phase: Phase = serde_json::from_str(json).unwrap();
        assert!(phase.depends_on.contains("b"));
        assert_eq!(phase.output_context_key, "a.out");
    }
}
