//! Project initialization and management (`conductor init`, `conductor project`).

use anyhow::Result;
use console::style;
use std::path::Path;

use conductor::config::{ConductorToml, CONFIG_DIR};
use conductor::workflow::models::PhaseStatus;

use super::super::ProjectCommands;
use super::config::write_default_config;

pub async fn cmd_init(project_dir: &Path, config: ConductorToml) -> Result<()> {
    let created = write_default_config(project_dir)?;
    let db_path = config.database_path(project_dir);
    super::open(project_dir, config).await?;

    let conductor_dir = project_dir.join(CONFIG_DIR);
    if created {
        println!(
            "Initialized conductor project at {}",
            conductor_dir.display()
        );
        println!();
        println!("Created:");
        println!("  {}", ConductorToml::path_in(project_dir).display());
        println!("  {}", db_path.display());
        println!();
        println!("Next steps:");
        println!("  1. Run `conductor project create <name> --repo <url>`");
        println!("  2. Run `conductor advance <project-id>` to start the vision review");
    } else {
        println!(
            "Conductor project already initialized at {}",
            conductor_dir.display()
        );
        println!("Database verified.");
    }
    Ok(())
}

pub async fn cmd_project(
    project_dir: &Path,
    config: ConductorToml,
    command: ProjectCommands,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;

    match command {
        ProjectCommands::Create {
            name,
            description,
            repo,
        } => {
            let project = orch.create_project(&name, description, repo).await?;
            println!(
                "{} Created project {} ({})",
                style("✓").green().bold(),
                style(project.id).bold(),
                project.name
            );
        }
        ProjectCommands::List => {
            let projects = orch.list_projects().await?;
            if projects.is_empty() {
                println!("No projects yet. Create one with `conductor project create <name>`.");
                return Ok(());
            }
            println!("{:<6} {:<16} {}", "ID", "STATUS", "NAME");
            for project in projects {
                println!(
                    "{:<6} {:<16} {}",
                    project.id,
                    project.status.as_str(),
                    project.name
                );
            }
        }
        ProjectCommands::Show { project } => {
            let p = orch.get_project(project).await?;
            println!("{} {}", style(format!("#{}", p.id)).dim(), style(&p.name).bold());
            if let Some(desc) = &p.description {
                println!("  {}", desc);
            }
            if let Some(url) = &p.github_repo_url {
                println!("  repo:   {}", url);
            }
            println!("  status: {}", p.status);
            println!();

            let phases = orch.phases(project).await?;
            if phases.is_empty() {
                println!("  {}", style("No phases started").dim());
            }
            for phase in &phases {
                let marker = match phase.status {
                    PhaseStatus::Completed => style("✓").green(),
                    PhaseStatus::Failed => style("✗").red(),
                    PhaseStatus::Blocked => style("⏸").yellow(),
                    PhaseStatus::InProgress => style("▶").cyan(),
                    PhaseStatus::Pending => style("·").dim(),
                };
                println!(
                    "  {} {:>2}. {:<26} {}",
                    marker,
                    phase.phase_number,
                    phase.name,
                    style(phase.status.as_str()).dim()
                );
                if let Some(err) = &phase.error {
                    println!("       {}", style(err).red());
                }
            }
            println!();

            let state = orch.workflow_state(project).await?;
            println!("Current: {}", state.current_phase);
            println!("Next:    {}", state.next_action);
            if let Some(gate) = state.pending_gate_id {
                println!(
                    "{}",
                    style(format!(
                        "Awaiting approval: conductor resolve {} --approve",
                        gate
                    ))
                    .yellow()
                );
            }
        }
    }
    Ok(())
}
