//! Conversation commands: messages, history and topics.

use anyhow::Result;
use console::style;
use std::path::Path;

use conductor::config::ConductorToml;
use conductor::workflow::models::MessageRole;

pub async fn cmd_message(
    project_dir: &Path,
    config: ConductorToml,
    project: i64,
    role: MessageRole,
    text: String,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    let recorded = orch.record_message(project, role, text).await?;
    if recorded.started_topic {
        println!(
            "{} Started new topic {}",
            style("↳").cyan(),
            recorded.topic_id()
        );
    }
    println!(
        "{} Recorded message {}",
        style("✓").green().bold(),
        recorded.message.id
    );
    Ok(())
}

pub async fn cmd_history(
    project_dir: &Path,
    config: ConductorToml,
    project: i64,
    all: bool,
    limit: Option<usize>,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    orch.get_project(project).await?;
    let messages = orch.history(project, !all, limit).await?;

    if messages.is_empty() {
        println!("{}", style("No messages").dim());
        return Ok(());
    }

    let mut current_topic = None;
    for msg in messages {
        if msg.topic_id != current_topic {
            current_topic = msg.topic_id;
            if let Some(topic) = current_topic {
                println!("{}", style(format!("── topic {} ──", topic)).dim());
            }
        }
        let role = match msg.role {
            MessageRole::User => style(msg.role.as_str()).cyan().bold(),
            MessageRole::Assistant => style(msg.role.as_str()).green().bold(),
            MessageRole::System => style(msg.role.as_str()).dim(),
        };
        println!(
            "{} {:<9} {}",
            style(msg.timestamp.format("%H:%M:%S")).dim(),
            role,
            msg.content
        );
    }
    Ok(())
}

pub async fn cmd_topics(
    project_dir: &Path,
    config: ConductorToml,
    project: i64,
    retitle: bool,
) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    orch.get_project(project).await?;

    if retitle {
        let active = orch
            .list_topics(project)
            .await?
            .into_iter()
            .find(|t| t.is_active);
        match active {
            Some(topic) => {
                let topic = orch.retitle_topic(topic.id).await?;
                println!(
                    "{} Topic {} is now \"{}\"",
                    style("✓").green().bold(),
                    topic.id,
                    topic.title
                );
            }
            None => anyhow::bail!("Project {} has no active topic", project),
        }
        return Ok(());
    }

    let topics = orch.list_topics(project).await?;
    if topics.is_empty() {
        println!("{}", style("No topics").dim());
        return Ok(());
    }
    println!("{:<6} {:<8} {:<18} {}", "ID", "ACTIVE", "STARTED", "TITLE");
    for topic in topics {
        println!(
            "{:<6} {:<8} {:<18} {}",
            topic.id,
            if topic.is_active { "*" } else { "" },
            topic.started_at.format("%Y-%m-%d %H:%M"),
            topic.title
        );
    }
    Ok(())
}

pub async fn cmd_clear(project_dir: &Path, config: ConductorToml, project: i64) -> Result<()> {
    let orch = super::open(project_dir, config).await?;
    orch.clear_conversation(project).await?;
    println!(
        "{} Cleared runtime conversation for project {}",
        style("✓").green().bold(),
        project
    );
    Ok(())
}
