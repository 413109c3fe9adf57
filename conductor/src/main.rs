//! Conductor CLI - plan, validate and run multi-agent workflows.
//!
//! # Usage
//!
//! ```bash
//! # List registered workers
//! conductor --registry workers.toml workers
//!
//! # Plan a workflow and save the document
//! conductor --registry workers.toml plan "design, implement and test a login API" --save login.json
//!
//! # Validate a saved document
//! conductor --registry workers.toml validate login.json
//!
//! # Dry-run a document with the echo executor
//! conductor --registry workers.toml run --document login.json --record run.json
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conductor::config::ConductorConfig;
use conductor::orchestration::{
    escalate, next_event, CreateOutcome, CreateWorkflowRequest, EchoExecutor, ExecutionEvent,
    Orchestrator, WorkflowDocument, WorkflowPattern, WorkflowRecord,
};
use conductor::registry::CapabilityRegistry;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Conductor - Multi-Agent Workflow Orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./conductor.toml)
    #[arg(short, long, global = true, env = "CONDUCTOR_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Worker registry file (.toml, .yaml or .json)
    #[arg(short, long, global = true, env = "CONDUCTOR_REGISTRY_PATH", default_value = "workers.toml")]
    registry: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PatternArg {
    Auto,
    Sequential,
    Parallel,
    Conditional,
    Hybrid,
}

impl From<PatternArg> for WorkflowPattern {
    fn from(arg: PatternArg) -> Self {
        match arg {
            PatternArg::Auto => WorkflowPattern::Auto,
            PatternArg::Sequential => WorkflowPattern::Sequential,
            PatternArg::Parallel => WorkflowPattern::Parallel,
            PatternArg::Conditional => WorkflowPattern::Conditional,
            PatternArg::Hybrid => WorkflowPattern::Hybrid,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DocumentFormatArg {
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose requirements into a validated workflow document
    Plan {
        /// Requirement text
        requirements: String,

        /// Workflow pattern
        #[arg(short, long, value_enum, default_value = "auto")]
        pattern: PatternArg,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: DocumentFormatArg,

        /// Write the document to a file instead of stdout
        #[arg(short, long)]
        save: Option<PathBuf>,
    },

    /// Validate a workflow document against the registry
    Validate {
        /// Document file (.json, .yaml or .yml)
        document: PathBuf,
    },

    /// Execute a workflow with the echo executor
    Run {
        /// Document file to execute
        #[arg(short, long, conflicts_with = "requirements", required_unless_present_any = ["requirements", "resume"])]
        document: Option<PathBuf>,

        /// Plan and execute these requirements
        #[arg(long)]
        requirements: Option<String>,

        /// Workflow pattern when planning from requirements
        #[arg(short, long, value_enum, default_value = "auto")]
        pattern: PatternArg,

        /// Continue a previously recorded run
        #[arg(long, conflicts_with_all = ["document", "requirements"])]
        resume: Option<PathBuf>,

        /// Write the final workflow record to this file
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// List registered workers
    Workers {
        /// Only workers carrying this capability
        #[arg(short = 't', long)]
        capability: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConductorConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConductorConfig::load().context("Failed to load configuration")?,
    };

    let json_logs = match cli.log_format {
        Some(format) => format == LogFormatArg::Json,
        None => config.logging.json,
    };
    init_logging(cli.verbose, json_logs, &config.logging.level);

    let registry = Arc::new(
        CapabilityRegistry::load_from_path(&cli.registry)
            .with_context(|| format!("Failed to load worker registry from {}", cli.registry.display()))?,
    );
    let orchestrator = Orchestrator::new(config, registry, Arc::new(EchoExecutor));

    match cli.command {
        Commands::Plan {
            requirements,
            pattern,
            format,
            save,
        } => plan(&orchestrator, &requirements, pattern.into(), format, save.as_deref()),

        Commands::Validate { document } => validate(&orchestrator, &document),

        Commands::Run {
            document,
            requirements,
            pattern,
            resume,
            record,
        } => {
            execute(
                &orchestrator,
                document.as_deref(),
                requirements.as_deref(),
                pattern.into(),
                resume.as_deref(),
                record.as_deref(),
            )
            .await
        }

        Commands::Workers { capability } => workers(&orchestrator, capability.as_deref()),
    }
}

fn plan(
    orchestrator: &Orchestrator,
    requirements: &str,
    pattern: WorkflowPattern,
    format: DocumentFormatArg,
    save: Option<&Path>,
) -> Result<()> {
    let request = CreateWorkflowRequest::new(requirements).with_pattern(pattern.as_str());
    let document = match orchestrator.create_workflow(&request)? {
        CreateOutcome::Created { document } => document,
        CreateOutcome::Rejected { validation } => {
            println!("{}", serde_json::to_string_pretty(&validation)?);
            anyhow::bail!("generated workflow failed validation: {}", validation.summary());
        }
    };

    let rendered = match format {
        DocumentFormatArg::Json => document.to_json()?,
        DocumentFormatArg::Yaml => document.to_yaml()?,
    };

    match save {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Workflow {} ({} phases, {}) written to {}",
                document.revision(),
                document.phases().len(),
                document.pattern(),
                path.display()
            );
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn validate(orchestrator: &Orchestrator, path: &Path) -> Result<()> {
    let document = WorkflowDocument::load(path)
        .with_context(|| format!("Failed to read workflow document {}", path.display()))?;
    let result = orchestrator.validate(&document);
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_valid() {
        anyhow::bail!("{} error(s): {}", result.errors.len(), result.summary());
    }
    Ok(())
}

async fn execute(
    orchestrator: &Orchestrator,
    document: Option<&Path>,
    requirements: Option<&str>,
    pattern: WorkflowPattern,
    resume: Option<&Path>,
    record_path: Option<&Path>,
) -> Result<()> {
    let handle = if let Some(path) = resume {
        let record = WorkflowRecord::load(path)
            .with_context(|| format!("Failed to read workflow record {}", path.display()))?;
        orchestrator.resume(record)?
    } else {
        let document = match (document, requirements) {
            (Some(path), _) => WorkflowDocument::load(path)
                .with_context(|| format!("Failed to read workflow document {}", path.display()))?,
            (None, Some(text)) => orchestrator
                .create_workflow(&CreateWorkflowRequest::new(text).with_pattern(pattern.as_str()))?
                .into_document()?,
            (None, None) => anyhow::bail!("either --document, --requirements or --resume is required"),
        };
        orchestrator.execute_workflow(document)?
    };

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = next_event(&mut events).await {
            let finished = matches!(event, ExecutionEvent::WorkflowFinished { .. });
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
            if finished {
                break;
            }
        }
    });

    let context = handle.context();
    let document = handle.document().clone();
    let state = handle.wait().await?;
    let _ = printer.await;

    if let Some(path) = record_path {
        WorkflowRecord::new(document.clone(), Some(state.clone()), context.export())
            .save(path)
            .with_context(|| format!("Failed to write workflow record {}", path.display()))?;
        println!("Record written to {}", path.display());
    }

    if let Some(result) = &state.aggregated_result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    escalate(&document, &state)?;
    Ok(())
}

fn workers(orchestrator: &Orchestrator, capability: Option<&str>) -> Result<()> {
    let registry = orchestrator.registry();
    let workers = match capability {
        Some(tag) => registry.find_by_capability(tag),
        None => registry.all(),
    };

    for worker in &workers {
        let capabilities: Vec<&str> = worker.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<9} {}",
            worker.id,
            worker.resource_tier.as_str(),
            capabilities.join(", ")
        );
    }

    let stats = registry.statistics();
    println!(
        "\n{} shown, {} registered, {} capabilities, {} general-purpose",
        workers.len(),
        stats.total_workers,
        stats.distinct_capabilities,
        stats.general_purpose_workers
    );
    Ok(())
}

/// Initialize logging based on verbosity level and format
fn init_logging(verbose: bool, json: bool, level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("conductor=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("conductor={},warn", level)))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
