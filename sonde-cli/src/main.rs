//! Sonde CLI — terminal interface for the sonde research engine.
//!
//! Runs a research task end-to-end, streams phase progress to stderr,
//! and prints the finished report as markdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

use sonde_core::config::{config_exists, load_config, EngineConfig};
use sonde_core::llm::{LlmGateway, OpenAiCompatGateway};
use sonde_core::progress::{ChannelSink, Phase, ProgressEvent, Status};
use sonde_core::search::{DuckDuckGoSearch, MockSearch, SearchGateway};
use sonde_core::session::{sessions_dir, ResearchSession};
use sonde_core::{render_markdown, ResearchEngine};

/// Sonde: iterative research reports from the command line
#[derive(Parser, Debug)]
#[command(name = "sonde", version, about, long_about = None)]
struct Cli {
    /// Research topic (required unless a subcommand is given)
    topic: Option<String>,

    /// LLM model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Override the research round cap
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Override the refinement iteration cap
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Write the report to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List and inspect persisted research sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a workspace configuration file with defaults
    Init,
    /// Show the effective configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum SessionAction {
    /// List persisted sessions
    List,
    /// Print the report from a persisted session
    Show {
        /// Session id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "sonde", "sonde")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sonde.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    if let Some(command) = cli.command {
        return handle_command(command, &workspace, &config).await;
    }

    let Some(topic) = cli.topic else {
        anyhow::bail!("No research topic given. Run `sonde \"your question\"` or `sonde --help`.");
    };

    if !config_exists(Some(&workspace)) {
        eprintln!("No configuration found; using defaults. Run `sonde config init` to customize.");
    }

    // Apply CLI overrides
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.pipeline.max_rounds = max_rounds;
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.refinement.max_iterations = max_iterations;
    }
    for warning in config.validate() {
        tracing::warn!("{warning}");
    }

    let llm = build_llm(&config)?;
    let search = build_search(&config);

    let engine = if cli.quiet {
        ResearchEngine::new(config, llm, search)
    } else {
        let (sink, events) = ChannelSink::pair();
        tokio::spawn(print_progress(events));
        ResearchEngine::with_progress_sink(config, llm, search, Arc::new(sink))
    };

    // Ctrl-C stops the run at the next phase boundary; the engine still
    // returns whatever report it assembled.
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancellation requested, finishing up...");
            cancel.cancel();
        }
    });

    let report = engine.run(&topic).await?;
    let rendered = render_markdown(&report);

    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, &rendered).await?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    if !cli.quiet {
        eprintln!(
            "\nDone: {} after {} tokens ({} citations)",
            report.termination_reason,
            report.usage.total(),
            report.citations.entries.len(),
        );
    }

    Ok(())
}

fn build_llm(config: &EngineConfig) -> anyhow::Result<Arc<dyn LlmGateway>> {
    let gateway = OpenAiCompatGateway::new(&config.llm)
        .map_err(|e| anyhow::anyhow!("LLM gateway setup failed: {}", e))?;
    Ok(Arc::new(gateway))
}

fn build_search(config: &EngineConfig) -> Arc<dyn SearchGateway> {
    match config.search.provider.as_str() {
        "mock" => Arc::new(MockSearch::new()),
        _ => Arc::new(DuckDuckGoSearch::new(&config.search)),
    }
}

async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => match action {
            ConfigAction::Init => {
                let dir = workspace.join(".sonde");
                std::fs::create_dir_all(&dir)?;
                let path = dir.join("config.toml");
                if path.exists() {
                    anyhow::bail!("{} already exists", path.display());
                }
                let rendered = toml::to_string_pretty(&EngineConfig::default())?;
                std::fs::write(&path, rendered)?;
                println!("Wrote {}", path.display());
            }
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(config)?);
            }
        },
        Commands::Sessions { action } => {
            let Some(dir) = sessions_dir(&config.session) else {
                anyhow::bail!("No sessions directory is configured");
            };
            match action {
                SessionAction::List => {
                    let sessions = ResearchSession::list_sessions(&dir).await;
                    if sessions.is_empty() {
                        println!("No sessions found in {}", dir.display());
                        return Ok(());
                    }
                    for summary in sessions {
                        println!(
                            "{}  {:<10}  rounds {}  {}  {}",
                            summary.id,
                            format!("{:?}", summary.phase).to_lowercase(),
                            summary.rounds_completed,
                            summary.updated_at.format("%Y-%m-%d %H:%M"),
                            summary.topic,
                        );
                    }
                }
                SessionAction::Show { id } => {
                    let id = Uuid::parse_str(&id)
                        .map_err(|_| anyhow::anyhow!("'{}' is not a valid session id", id))?;
                    let session = ResearchSession::load(&dir, &id).await?;
                    match &session.report {
                        Some(report) => println!("{}", render_markdown(report)),
                        None => println!(
                            "Session '{}' has no report yet (phase: {:?})",
                            session.topic, session.phase
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}

/// Render progress events as short stderr lines.
async fn print_progress(mut events: tokio_stream::wrappers::UnboundedReceiverStream<ProgressEvent>) {
    while let Some(event) = events.next().await {
        if let Some(line) = describe(&event) {
            eprintln!("  {line}");
        }
    }
}

fn describe(event: &ProgressEvent) -> Option<String> {
    let get = |key: &str| event.payload.get(key);
    let num = |key: &str| get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);

    match (event.phase, event.status) {
        (Phase::Plan, Status::Start) => Some("planning report sections".to_string()),
        (Phase::Plan, Status::End) => Some(format!("plan ready ({} sections)", num("sections"))),
        (Phase::Query, Status::Start) => Some(format!("round {}: generating queries", num("round"))),
        (Phase::Search, Status::End) => {
            let failed = num("failed");
            if failed > 0 {
                Some(format!("{} results ({} queries failed)", num("results"), failed))
            } else {
                Some(format!("{} results", num("results")))
            }
        }
        (Phase::Synthesize, Status::End) => {
            Some(format!("synthesized {} sections", num("synthesized")))
        }
        (Phase::Review, Status::End) => {
            let verdict = if get("continue").and_then(serde_json::Value::as_bool) == Some(true) {
                "continue"
            } else {
                "stop"
            };
            let rationale = get("rationale").and_then(serde_json::Value::as_str).unwrap_or("");
            Some(format!("reviewer says {verdict}: {rationale}"))
        }
        (Phase::Refine, Status::Start) => {
            let strategy = get("strategy").and_then(serde_json::Value::as_str).unwrap_or("?");
            Some(format!("refining (iteration {}, {strategy})", num("iteration")))
        }
        (Phase::Finalize, Status::End) => Some(format!(
            "report finalized ({} chars, {} citations)",
            num("chars"),
            num("citations"),
        )),
        _ => None,
    }
}
