//! Conductor - Multi-Agent Workflow Orchestration
//!
//! Conductor decomposes a natural-language requirement into phases, binds each
//! phase to a capability-tagged worker, and executes the resulting workflow with
//! retry, fallback and tiered context propagation.
//!
//! # Architecture
//!
//! - `registry` - Capability registry of worker descriptors
//! - `context` - Tiered, size-aware store for phase outputs
//! - `orchestration` - Decomposer, matcher, generator, validator and execution engine
//! - `config` - TOML configuration with environment overrides
//! - `error` - Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor::prelude::*;
//!
//! # async fn example() -> conductor::Result<()> {
//! let registry = Arc::new(CapabilityRegistry::from_descriptors([
//!     WorkerDescriptor::new("architect", ["architecture"], ResourceTier::Standard),
//!     WorkerDescriptor::new("generalist", ["general"], ResourceTier::Standard),
//! ])?);
//! let orchestrator = Orchestrator::new(ConductorConfig::default(), registry, Arc::new(EchoExecutor));
//!
//! let request = CreateWorkflowRequest::new("design, implement and test a login API");
//! let document = orchestrator.create_workflow(&request)?.into_document()?;
//! let state = orchestrator.execute_workflow(document)?.wait().await?;
//! println!("{}", state.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod orchestration;
pub mod registry;

pub use config::ConductorConfig;
pub use error::{ConductorError, Result};
pub use orchestration::Orchestrator;

/// Commonly used types
pub mod prelude {
    pub use crate::config::ConductorConfig;
    pub use crate::context::{ContextEntry, ContextStore, ContextTier};
    pub use crate::error::{ConductorError, Result};
    pub use crate::orchestration::{
        CreateOutcome, CreateWorkflowRequest, EchoExecutor, ExecutionEvent, ExecutionHandle,
        ExecutionState, Orchestrator, PhaseExecutor, PhaseStatus, RunStatus, WorkerInvocation,
        WorkerResponse, WorkflowDocument, WorkflowPattern, WorkflowRecord,
    };
    pub use crate::registry::{CapabilityRegistry, ResourceTier, WorkerDescriptor};
}

/// Conductor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
