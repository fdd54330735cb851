use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quill_core::config::AppConfig;
use quill_core::event::EventBus;
use quill_core::types::{RunId, WorkflowEvent};

use quill_agent::{open_store, CheckpointStore, Critique, ResearchWorkflow};

#[derive(Parser)]
#[command(name = "quill", version, about = "Research a topic and write an article about it")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quill.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Research a topic and print the finished article
    Research {
        /// The topic (read from stdin when omitted)
        #[arg(trailing_var_arg = true)]
        topic: Vec<String>,
    },
    /// Continue an interrupted run from its last checkpoint
    Resume {
        run_id: String,
    },
    /// Show the checkpoints recorded for a run
    History {
        run_id: String,
        /// Print full checkpoint states as JSON
        #[arg(long)]
        json: bool,
    },
    /// List runs with checkpoints
    Runs,
    /// Delete a run's checkpoints
    Delete {
        run_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("QUILL_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("quill=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "quill", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Runs => {
            let store = open_store(&config)?;
            list_runs(store.as_ref())?;
        }
        Commands::History { run_id, json } => {
            let store = open_store(&config)?;
            print_history(store.as_ref(), &run_id, json)?;
        }
        Commands::Delete { run_id } => {
            let store = open_store(&config)?;
            let removed = store.delete_run(&run_id)?;
            println!("Removed {} checkpoint(s) for {}", removed, run_id);
        }
        Commands::Research { topic } => {
            let mut text = topic.join(" ");
            if text.trim().is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let text = text.trim();
            if text.is_empty() {
                anyhow::bail!("No topic given");
            }

            let run_id = RunId::new();
            let workflow = build_workflow(&config)?;
            eprintln!("[run: {}]", run_id);
            let article =
                with_interrupt(&workflow, workflow.run_research_as(run_id, text)).await?;
            println!("{}", article);
        }
        Commands::Resume { run_id } => {
            let workflow = build_workflow(&config)?;
            let article = with_interrupt(&workflow, workflow.resume(&run_id)).await?;
            println!("{}", article);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// `quill.toml`, then `~/.quill/config.toml`, then the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    if let Some(home_config) = dirs_home().map(|h| h.join(".quill").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    eprintln!("Warning: No config file found. Using OPENAI_API_KEY / TAVILY_API_KEY from the environment.");
    let config = AppConfig::from_env();
    config.validate()?;
    Ok(config)
}

fn build_workflow(config: &AppConfig) -> anyhow::Result<ResearchWorkflow> {
    let search_config = config
        .web_search
        .as_ref()
        .context("No search provider configured. Add [web_search] or set TAVILY_API_KEY")?;

    std::fs::create_dir_all(config.workspace_dir()).ok();

    let llm = quill_llm::build_client(config);
    let search = quill_search::create_provider(search_config)?;
    let store = open_store(config)?;
    let events = Arc::new(EventBus::default());

    spawn_progress_printer(&events);

    Ok(ResearchWorkflow::from_config(config, llm, search, store, events)?)
}

/// Report step progress on stderr, keeping stdout for the article.
fn spawn_progress_printer(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkflowEvent::StepStarted { node, .. } => eprintln!("[{}] ...", node),
                WorkflowEvent::StepCompleted {
                    node, elapsed_ms, ..
                } => eprintln!("[{}] done in {}ms", node, elapsed_ms),
                WorkflowEvent::RunFailed { node, error, .. } => {
                    eprintln!("[{}: ERROR] {}", node, error)
                }
                WorkflowEvent::RunAborted { reason, .. } => eprintln!("[aborted] {}", reason),
                _ => {}
            }
        }
    });
}

/// Drive `fut`, cancelling every active run on Ctrl-C.
async fn with_interrupt<F>(workflow: &ResearchWorkflow, fut: F) -> anyhow::Result<String>
where
    F: std::future::Future<Output = quill_core::Result<String>>,
{
    let registry = workflow.registry().clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for run_id in registry.active() {
                eprintln!("\nCancelling {} after the current step...", run_id);
            }
            registry.cancel_all();
        }
    });

    let result = fut.await;
    watcher.abort();
    Ok(result?)
}

fn list_runs(store: &dyn CheckpointStore) -> anyhow::Result<()> {
    let runs = store.runs()?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run_id in runs {
        match store.latest_checkpoint(&run_id)? {
            Some(cp) => println!(
                "{}  steps={}  last={}  topic={:?}  at={}",
                run_id,
                cp.sequence,
                cp.node,
                cp.state.topic(),
                cp.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("{}", run_id),
        }
    }
    Ok(())
}

fn print_history(store: &dyn CheckpointStore, run_id: &str, json: bool) -> anyhow::Result<()> {
    let history = store.history(run_id)?;
    if history.is_empty() {
        anyhow::bail!("No checkpoints for run {}", run_id);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    for cp in &history {
        let review = match cp.state.critique() {
            None => "-".to_string(),
            Some(Critique::Approved) => "approved".to_string(),
            Some(Critique::NeedsRevision(feedback)) => {
                format!("needs revision: {}", truncate(feedback, 60))
            }
        };
        println!(
            "#{:<3} {:<9} sources={:<3} article={:<6} review={}",
            cp.sequence,
            cp.node,
            cp.state.search_results().map(|d| d.len()).unwrap_or(0),
            cp.state.article().map(|a| a.chars().count()).unwrap_or(0),
            review
        );
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
