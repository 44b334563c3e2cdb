//! Phase, gate and execution commands.

use anyhow::Result;
use console::style;
use std::path::Path;

use conductor::config::ConductorToml;
use conductor::workflow::models::{ExecutionStatus, GateStatus};

pub async fn cmd_advance(project_dir: &Path, config: ConductorToml, project: i64) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    let cancel = super::cancel_on_ctrl_c();
    let outcome = orch.advance(project, &cancel).await?;
    super::report(outcome)
}

pub async fn cmd_resolve(
    project_dir: &Path,
    config: ConductorToml,
    gate: i64,
    approve: bool,
    notes: Option<String>,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    let cancel = super::cancel_on_ctrl_c();
    let outcome = orch.resolve(gate, approve, notes, &cancel).await?;
    super::report(outcome)
}

pub async fn cmd_retry(project_dir: &Path, config: ConductorToml, project: i64) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    let cancel = super::cancel_on_ctrl_c();
    let outcome = orch.retry(project, &cancel).await?;
    super::report(outcome)
}

pub async fn cmd_reset(project_dir: &Path, config: ConductorToml, project: i64) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    if orch.reset_workflow(project).await? {
        println!(
            "{} Project {} reset to brainstorming",
            style("✓").green().bold(),
            project
        );
        Ok(())
    } else {
        anyhow::bail!("Project {} not found", project)
    }
}

pub async fn cmd_gates(
    project_dir: &Path,
    config: ConductorToml,
    project: i64,
    all: bool,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    orch.get_project(project).await?;
    let gates = if all {
        orch.gate_history(project).await?
    } else {
        orch.pending_gates(project).await?
    };

    if gates.is_empty() {
        println!("{}", style("No approval gates").dim());
        return Ok(());
    }

    println!(
        "{:<6} {:<15} {:<10} {}",
        "ID", "TYPE", "STATUS", "QUESTION"
    );
    for gate in gates {
        let status = match gate.status {
            GateStatus::Pending => style(gate.status.as_str()).yellow(),
            GateStatus::Approved => style(gate.status.as_str()).green(),
            GateStatus::Rejected | GateStatus::Expired => style(gate.status.as_str()).red(),
        };
        println!(
            "{:<6} {:<15} {:<10} {}",
            gate.id,
            gate.gate_type.as_str(),
            status,
            gate.question
        );
        if gate.status == GateStatus::Pending {
            println!("       {}", style(&gate.context.summary).dim());
            if let Some(considerations) = &gate.context.considerations {
                println!("       {}", style(considerations).dim());
            }
        } else if let Some(notes) = &gate.response_notes {
            println!("       notes: {}", notes);
        }
    }
    Ok(())
}

pub async fn cmd_executions(
    project_dir: &Path,
    config: ConductorToml,
    project: i64,
    limit: usize,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    orch.get_project(project).await?;
    let executions = orch.command_history(project, limit).await?;

    if executions.is_empty() {
        println!("{}", style("No command executions").dim());
        return Ok(());
    }

    println!(
        "{:<6} {:<22} {:<10} {:<10} {}",
        "ID", "COMMAND", "STATUS", "DURATION", "STARTED"
    );
    for exec in executions {
        let duration = match (exec.started_at, exec.completed_at) {
            (Some(start), Some(end)) => format!("{}s", (end - start).num_seconds()),
            _ => "-".to_string(),
        };
        let started = exec
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = match exec.status {
            ExecutionStatus::Completed => style(exec.status.as_str()).green(),
            ExecutionStatus::Failed => style(exec.status.as_str()).red(),
            _ => style(exec.status.as_str()).yellow(),
        };
        println!(
            "{:<6} {:<22} {:<10} {:<10} {}",
            exec.id,
            exec.command.as_str(),
            status,
            duration,
            started
        );
        if let Some(err) = &exec.error {
            println!("       {}", style(err).red());
        }
    }
    Ok(())
}

pub async fn cmd_reconcile(project_dir: &Path, config: ConductorToml) -> Result<()> {
    // `open` already fails abandoned executions.
    let orch = super::open(project_dir, config).await?;
    let expired = orch.expire_stale_gates(chrono::Utc::now()).await?;
    for gate in &expired {
        println!(
            "{} Gate {} expired (project {} paused)",
            style("⚠").yellow(),
            gate.id,
            gate.project_id
        );
    }
    println!("{} Reconciled", style("✓").green().bold());
    Ok(())
}
