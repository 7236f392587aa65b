//! Easel CLI - run snippets and chat turns against local workspaces
//!
//! Usage:
//!   easel exec -w demo -c "return 1 + 1"   Execute a snippet string
//!   easel exec -w demo script.js           Execute a snippet file
//!   easel exec -w demo                     Read the snippet from stdin
//!   easel chat -w demo "Plot signups"      Run one agent turn
//!   easel workspace create demo            Create a workspace
//!   easel workspace list                   List workspaces

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use easel::agent::{AgentRuntime, AnthropicBackend, ContentPart, Delta, QueryRequest, StreamEvent, StreamMessage};
use easel::panel::extract_panel_updates;
use easel::sandbox::{RemoteExecutor, SandboxManager};
use easel::{EaselConfig, WorkspaceStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Easel - capability-scoped JavaScript for canvas workspaces
#[derive(Parser, Debug)]
#[command(name = "easel")]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a snippet in a workspace sandbox
    Exec {
        /// Workspace ID
        #[arg(short, long)]
        workspace: String,

        /// Inline snippet
        #[arg(short = 'c', long = "code", conflicts_with = "file")]
        code: Option<String>,

        /// Snippet file
        file: Option<PathBuf>,
    },
    /// Run one agent turn and stream its events
    Chat {
        /// Workspace ID
        #[arg(short, long)]
        workspace: String,

        /// Print raw JSON events instead of text
        #[arg(long)]
        json: bool,

        /// The prompt
        prompt: String,
    },
    /// Manage workspaces
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    /// Create a workspace
    Create {
        /// Workspace ID
        id: String,

        /// Display name (defaults to the ID)
        #[arg(long)]
        name: Option<String>,

        /// Description
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List workspaces
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = EaselConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let store = WorkspaceStore::new(&config.data_dir, config.lock_timeout);

    match args.command {
        Command::Exec { workspace, code, file } => {
            let code = read_snippet(code, file)?;
            let ok = exec(&config, store, &workspace, &code).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Command::Chat { workspace, json, prompt } => chat(&config, store, workspace, prompt, json).await?,
        Command::Workspace(WorkspaceCommand::Create { id, name, description }) => {
            let name = name.unwrap_or_else(|| id.clone());
            let workspace = store.create_workspace_with_id(&id, &name, &description).await?;
            println!("created {}", workspace.id);
        }
        Command::Workspace(WorkspaceCommand::List) => {
            for workspace in store.list_workspaces().await? {
                println!("{}\t{}", workspace.id, workspace.name);
            }
        }
    }

    Ok(())
}

fn read_snippet(code: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(file) = file {
        return std::fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()));
    }
    let mut code = String::new();
    io::stdin()
        .read_to_string(&mut code)
        .context("failed to read stdin")?;
    Ok(code)
}

async fn exec(config: &EaselConfig, store: WorkspaceStore, workspace: &str, code: &str) -> anyhow::Result<bool> {
    let sandboxes = SandboxManager::from_config(store, config)?;
    let sandbox = sandboxes.get_or_create(workspace)?;
    let output = sandbox.execute(code).await?;

    let (text, updates) = extract_panel_updates(&output.text);
    println!("{text}");
    for update in &updates {
        eprintln!("panel {:?}: {}", update.action, update.panel.id);
    }
    Ok(output.is_success())
}

async fn chat(
    config: &EaselConfig,
    store: WorkspaceStore,
    workspace: String,
    prompt: String,
    json: bool,
) -> anyhow::Result<()> {
    let backend = AnthropicBackend::from_env(config.anthropic.clone())?;
    let sandboxes = Arc::new(SandboxManager::from_config(store.clone(), config)?);
    let mut runtime = AgentRuntime::new(store, Arc::new(backend), sandboxes);
    if let Some(url) = &config.python_sandbox_url {
        runtime = runtime.with_python(RemoteExecutor::new(url)?);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            ctrl_c.cancel();
        }
    });

    let mut events = runtime.query(QueryRequest::new(workspace, prompt), cancel).await?;
    let mut stdout = io::stdout();
    while let Some(event) = events.recv().await {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
            continue;
        }
        match &event {
            StreamMessage::StreamEvent {
                event:
                    StreamEvent::ContentBlockDelta {
                        delta: Delta::TextDelta { text },
                        ..
                    },
            } => write!(stdout, "{text}")?,
            StreamMessage::StreamEvent {
                event:
                    StreamEvent::ContentBlockStart {
                        content_block: ContentPart::ToolUse { name, .. },
                        ..
                    },
            } => writeln!(stdout, "\n[{name}]")?,
            StreamMessage::PanelUpdate { panel_updates } => {
                for update in panel_updates {
                    writeln!(stdout, "[panel {:?}: {}]", update.action, update.panel.id)?;
                }
            }
            StreamMessage::Error { error } => {
                writeln!(stdout)?;
                anyhow::bail!("agent error: {error}");
            }
            StreamMessage::Aborted => writeln!(stdout, "\n(stopped)")?,
            StreamMessage::Done => writeln!(stdout)?,
            _ => {}
        }
        stdout.flush()?;
    }

    Ok(())
}
