//! Error types for the Conductor orchestration engine.

use crate::orchestration::validator::ValidationResult;

/// Result type alias for Conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Main error type for the Conductor system.
///
/// Structural errors (cycles, dangling references) are always fatal at validation time.
/// Runtime worker failures are retried by the execution engine before they surface here.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Requirement text was empty or produced no sub-tasks
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// A worker with the same id is already registered
    #[error("Worker already registered: {id}")]
    DuplicateWorker { id: String },

    /// Worker id is not present in the registry
    #[error("Worker not found: {id}")]
    WorkerNotFound { id: String },

    /// No worker scored above the threshold and no general-purpose worker exists
    #[error("No suitable worker for phase {phase_id}")]
    NoMatch { phase_id: String },

    /// The phase dependency graph contains a cycle
    #[error("Cycle detected in phase dependencies: {}", phases.join(" -> "))]
    CyclicDependency { phases: Vec<String> },

    /// A phase consumes a context key none of its transitive dependencies produce
    #[error("Phase {phase_id} reads context key '{key}' which no upstream phase produces")]
    DanglingContextReference { phase_id: String, key: String },

    /// A phase depends on a phase that does not exist
    #[error("Dependency not found: phase {phase_id}, dependency {dependency_id}")]
    MissingDependency {
        phase_id: String,
        dependency_id: String,
    },

    /// Two phases share an id
    #[error("Duplicate phase id: {phase_id}")]
    DuplicatePhase { phase_id: String },

    /// Two phases declare the same output key
    #[error("Context key '{key}' is produced by more than one phase: {}", phases.join(", "))]
    DuplicateOutputKey { key: String, phases: Vec<String> },

    /// Document failed validation
    #[error("Invalid workflow document: {}", .0.summary())]
    InvalidDocument(Box<ValidationResult>),

    /// A phase failed at runtime after retries and fallbacks were exhausted
    #[error("Worker execution failed for phase {phase_id} on {worker_id}: {reason}")]
    WorkerExecution {
        phase_id: String,
        worker_id: String,
        reason: String,
    },

    /// No run with this id is tracked
    #[error("Execution run not found: {run_id}")]
    RunNotFound { run_id: uuid::Uuid },

    /// A context entry cannot be brought under the size ceiling
    #[error("Context entry '{key}' is {size_bytes} bytes after compression, ceiling is {ceiling_bytes}")]
    ContextOverflow {
        key: String,
        size_bytes: usize,
        ceiling_bytes: usize,
    },

    /// A phase tried to write a context key owned by another phase
    #[error("Context key '{key}' is owned by {owner}, rejected write from {writer}")]
    ContextOwnership {
        key: String,
        owner: String,
        writer: String,
    },

    /// Context key does not exist
    #[error("Context key not found: {key}")]
    ContextNotFound { key: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The workflow run was cancelled
    #[error("Workflow execution cancelled")]
    Cancelled,

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    /// Create a new decomposition error
    pub fn decomposition(msg: impl Into<String>) -> Self {
        Self::Decomposition(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error describes a defect in the workflow document itself
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::DanglingContextReference { .. }
                | Self::MissingDependency { .. }
                | Self::DuplicatePhase { .. }
                | Self::DuplicateOutputKey { .. }
                | Self::InvalidDocument(_)
        )
    }
}
