use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ragstack::analysis::{self, Severity};
use ragstack::{
    config, stack, ApplyBackend, Blueprint, CloudFormationBackend, Engine, FileStateStore, Plan,
    SimulatedProvider, StackConfig, StateStore,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    /// In-process simulated provider with a JSON state file
    Local,
    /// One CloudFormation stack
    Cloudformation,
}

#[derive(Debug, Parser)]
#[command(name = "ragstack", version, about = "Plan and deploy the RAG API stack")]
struct Cli {
    /// Config file; defaults to RAGSTACK_CONFIG, then ./ragstack.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file for the local backend
    #[arg(long, global = true, default_value = ".ragstack/state.json")]
    state: PathBuf,

    #[arg(long, global = true, env = "RAGSTACK_LOG", default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the CloudFormation template
    Template,
    /// Print the creation order and every dependency edge
    Graph,
    /// Run static analysis; fails on errors
    Check,
    /// Diff the graph against the state file
    Plan,
    /// Apply the graph
    Apply {
        #[arg(long, value_enum, default_value = "local")]
        backend: BackendKind,
    },
    /// Tear everything down, dependents first
    Destroy {
        #[arg(long, value_enum, default_value = "local")]
        backend: BackendKind,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_writer(std::io::stderr)),
        ),
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_writer(std::io::stderr)),
        ),
    };
}

fn local_engine(
    config: &StackConfig,
    state: &Path,
) -> anyhow::Result<Engine<SimulatedProvider, FileStateStore>> {
    let blueprint = Blueprint::new(config);
    let store = FileStateStore::open(state)
        .with_context(|| format!("opening state {}", state.display()))?;
    let provider = SimulatedProvider::new(config.aws.region.clone(), config.aws.account_id());
    Ok(Engine::new(provider, store, blueprint.pseudo_parameters()))
}

async fn open_backend(
    kind: BackendKind,
    config: &StackConfig,
    state: &Path,
) -> anyhow::Result<Box<dyn ApplyBackend>> {
    let backend: Box<dyn ApplyBackend> = match kind {
        BackendKind::Local => Box::new(local_engine(config, state)?),
        BackendKind::Cloudformation => {
            let stack_name = config.stack_name.clone();
            Box::new(CloudFormationBackend::from_env(&config.aws.region, stack_name).await)
        }
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let config = config::load(cli.config.as_deref()).context("loading configuration")?;
    let blueprint = Blueprint::new(&config);
    let graph = blueprint.build().context("assembling resource graph")?;

    match cli.command {
        Command::Template => {
            let description = format!("{} RAG API stack", config.stack_name);
            let template = stack::render(&graph, Some(description))?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        Command::Graph => {
            for (i, id) in graph.topological_order()?.iter().enumerate() {
                let kind = graph.get(id.as_str()).map(|s| s.kind.type_name()).unwrap_or_default();
                println!("{:>3} {id} ({kind})", i + 1);
            }
            for (before, after) in graph.edges()? {
                println!("{before} -> {after}");
            }
        }
        Command::Check => {
            let findings = analysis::analyze(&graph, &blueprint.pseudo_parameters());
            for finding in &findings {
                println!("{finding}");
            }
            let errors = findings.iter().filter(|f| f.severity == Severity::Error).count();
            info!(findings = findings.len(), errors, "analysis finished");
            if errors > 0 {
                bail!("{errors} analysis error(s)");
            }
        }
        Command::Plan => {
            let store = FileStateStore::open(&cli.state)?;
            let plan = Plan::compute(&graph, &store)?;
            println!("{plan}");
        }
        Command::Apply { backend: kind } => {
            let findings = analysis::analyze(&graph, &blueprint.pseudo_parameters());
            if analysis::has_errors(&findings) {
                for finding in findings.iter().filter(|f| f.severity == Severity::Error) {
                    eprintln!("{finding}");
                }
                bail!("refusing to apply a graph with analysis errors");
            }
            let mut backend = open_backend(kind, &config, &cli.state).await?;
            let report = backend.apply(&graph).await?;
            println!("{report}");
            if !report.is_success() {
                bail!("apply finished with failures");
            }
        }
        Command::Destroy { backend: kind } => {
            let mut backend = open_backend(kind, &config, &cli.state).await?;
            let report = backend.destroy(&graph).await?;
            println!("{report}");
            if !report.is_success() {
                bail!("destroy finished with failures");
            }
            if let BackendKind::Local = kind {
                let remaining = FileStateStore::open(&cli.state)?.ids()?;
                info!(remaining = remaining.len(), "state after destroy");
            }
        }
    }
    Ok(())
}
