//! Worker descriptors and resource tiers

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Capability tag reserved for general-purpose workers
pub const GENERAL_CAPABILITY: &str = "general";

/// Cost/capability class of a worker, also used as the declared complexity of a phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Light,
    #[default]
    Standard,
    Heavy,
}

impl ResourceTier {
    /// Ordinal used for distance computations
    pub fn rank(&self) -> u8 {
        match self {
            Self::Light => 0,
            Self::Standard => 1,
            Self::Heavy => 2,
        }
    }

    /// Number of steps between two tiers (0..=2)
    pub fn distance(&self, other: ResourceTier) -> u8 {
        self.rank().abs_diff(other.rank())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Heavy => "heavy",
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "standard" => Ok(Self::Standard),
            "heavy" => Ok(Self::Heavy),
            other => Err(format!(
                "Invalid resource tier '{}'. Must be one of: light, standard, heavy",
                other
            )),
        }
    }
}

/// Immutable description of a worker that phases can be bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique worker id
    pub id: String,

    /// Capability tags, normalized to lowercase
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default, alias = "resourceTier")]
    pub resource_tier: ResourceTier,

    /// Workers this one is known to cooperate well with
    #[serde(default, alias = "compatibleWith")]
    pub compatible_with: BTreeSet<String>,

    /// Workers this one should not be chained with
    #[serde(default, alias = "conflictsWith")]
    pub conflicts_with: BTreeSet<String>,

    /// Free-text description, fed to semantic similarity when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WorkerDescriptor {
    /// Create a descriptor with the given capabilities and tier
    pub fn new<I, S>(id: impl Into<String>, capabilities: I, resource_tier: ResourceTier) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities
                .into_iter()
                .map(|c| normalize_tag(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
            resource_tier,
            compatible_with: BTreeSet::new(),
            conflicts_with: BTreeSet::new(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_conflicts<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflicts_with.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_compatible<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compatible_with.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(&normalize_tag(tag))
    }

    /// Whether this worker carries the general-purpose tag
    pub fn is_general_purpose(&self) -> bool {
        self.capabilities.contains(GENERAL_CAPABILITY)
    }

    pub fn conflicts_with_worker(&self, other_id: &str) -> bool {
        self.conflicts_with.contains(other_id)
    }

    /// Normalize tags read from files so lookups are case-insensitive
    pub(crate) fn normalized(mut self) -> Self {
        self.id = self.id.trim().to_string();
        self.capabilities = self
            .capabilities
            .iter()
            .map(|c| normalize_tag(c))
            .filter(|c| !c.is_empty())
            .collect();
        self
    }
}

/// Lowercase and trim a capability tag
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
