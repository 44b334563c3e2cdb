use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conductor::config::ConductorToml;
use conductor::workflow::models::MessageRole;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Human-gated development workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .conductor/ with a default config and an empty database
    Init,
    /// Create, list or inspect projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Start the next pipeline phase of a project
    Advance { project: i64 },
    /// Approve or reject an approval gate
    Resolve {
        gate: i64,
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,
        #[arg(long)]
        reject: bool,
        /// Notes stored with the decision
        #[arg(long)]
        notes: Option<String>,
    },
    /// Re-run a failed phase, or reopen the gate of a rejected one
    Retry { project: i64 },
    /// Put a project back into brainstorming
    Reset { project: i64 },
    /// Record a conversation message (user messages may open a new topic)
    Message {
        project: i64,
        #[arg(long, default_value = "user")]
        role: MessageRole,
        text: String,
    },
    /// Show conversation history
    History {
        project: i64,
        /// Include messages from ended topics
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List conversation topics
    Topics {
        project: i64,
        /// Regenerate the active topic's title from its first user message
        #[arg(long)]
        retitle: bool,
    },
    /// List approval gates (pending only unless --all)
    Gates {
        project: i64,
        #[arg(long)]
        all: bool,
    },
    /// Show recent command executions
    Executions {
        project: i64,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Clear the project's conversation on the agent runtime
    Clear { project: i64 },
    /// Fail abandoned executions and expire stale gates
    Reconcile,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Create a project
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Repository URL; its name selects the runtime workspace
        #[arg(long)]
        repo: Option<String>,
    },
    /// List all projects
    List,
    /// Show a project's phases and workflow state
    Show { project: i64 },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = ConductorToml::load_or_default(&project_dir)?;
    config.apply_env_overrides()?;
    conductor::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir, config).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command.clone())?,
        Commands::Project { command } => {
            cmd::cmd_project(&project_dir, config, command.clone()).await?
        }
        Commands::Advance { project } => cmd::cmd_advance(&project_dir, config, *project).await?,
        Commands::Resolve {
            gate,
            approve,
            reject: _,
            notes,
        } => cmd::cmd_resolve(&project_dir, config, *gate, *approve, notes.clone()).await?,
        Commands::Retry { project } => cmd::cmd_retry(&project_dir, config, *project).await?,
        Commands::Reset { project } => cmd::cmd_reset(&project_dir, config, *project).await?,
        Commands::Message {
            project,
            role,
            text,
        } => cmd::cmd_message(&project_dir, config, *project, *role, text.clone()).await?,
        Commands::History {
            project,
            all,
            limit,
        } => cmd::cmd_history(&project_dir, config, *project, *all, *limit).await?,
        Commands::Topics { project, retitle } => {
            cmd::cmd_topics(&project_dir, config, *project, *retitle).await?
        }
        Commands::Gates { project, all } => {
            cmd::cmd_gates(&project_dir, config, *project, *all).await?
        }
        Commands::Executions { project, limit } => {
            cmd::cmd_executions(&project_dir, config, *project, *limit).await?
        }
        Commands::Clear { project } => cmd::cmd_clear(&project_dir, config, *project).await?,
        Commands::Reconcile => cmd::cmd_reconcile(&project_dir, config).await?,
    }

    Ok(())
}
