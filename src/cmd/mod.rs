//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                          |
//! |-----------------|-----------------------------------------------------------|
//! | `project`       | `Init`, `Project`                                         |
//! | `workflow`      | `Advance`, `Resolve`, `Retry`, `Reset`, `Gates`,          |
//! |                 | `Executions`, `Reconcile`                                 |
//! | `conversation`  | `Message`, `History`, `Topics`, `Clear`                   |
//! | `config`        | `Config`                                                  |

pub mod config;
pub mod conversation;
pub mod project;
pub mod workflow;

pub use config::cmd_config;
pub use conversation::{cmd_clear, cmd_history, cmd_message, cmd_topics};
pub use project::{cmd_init, cmd_project};
pub use workflow::{
    cmd_advance, cmd_executions, cmd_gates, cmd_reconcile, cmd_reset, cmd_resolve, cmd_retry,
};

use anyhow::Result;
use std::path::Path;

use conductor::config::ConductorToml;
use conductor::workflow::Orchestrator;
use conductor::workflow::models::Outcome;
use tokio_util::sync::CancellationToken;

/// Open the project's orchestrator. Abandoned executions left by an earlier
/// process are failed first, so every command sees reconciled state.
pub(crate) async fn open(project_dir: &Path, config: ConductorToml) -> Result<Orchestrator> {
    let orch = Orchestrator::open(project_dir, config)?;
    let reconciled = orch
        .reconcile_stale_executions(chrono::Utc::now())
        .await?;
    if !reconciled.is_empty() {
        eprintln!(
            "{} {} abandoned execution(s) marked failed",
            console::style("⚠").yellow(),
            reconciled.len()
        );
    }
    Ok(orch)
}

/// Token cancelled on Ctrl-C.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

/// Print a successful outcome, or turn a failed one into the command's error.
pub(crate) fn report(outcome: Outcome) -> Result<()> {
    if outcome.success {
        println!("{} {}", console::style("✓").green().bold(), outcome.message);
        Ok(())
    } else {
        anyhow::bail!("{}", outcome.message)
    }
}
