//! Command execution against the remote agent runtime.
//!
//! One `execute` call owns one `command_executions` row: it is created Queued,
//! moved to Running before anything is sent, and finished exactly once as
//! Completed or Failed. A cancelled call leaves the row Running for
//! `reconcile_stale_executions` to pick up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::client::RuntimeClient;
use super::clock::Clock;
use super::quiescence::{QuiescenceSettings, wait_for_quiescence};
use super::types::RuntimeMessage;
use crate::config::RuntimeSection;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::workflow::db::DbHandle;
use crate::workflow::locks::ProjectGuard;
use crate::workflow::models::{
    AgentCommand, CommandExecution, ExecutionStatus, PhaseStatus, Project,
};

/// Successful command run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution: CommandExecution,
    pub output: String,
    pub duration: Duration,
}

pub struct CommandExecutor {
    db: DbHandle,
    client: Arc<dyn RuntimeClient>,
    clock: Arc<dyn Clock>,
    config: RuntimeSection,
}

/// Quote arguments containing spaces and join them with single spaces.
pub fn format_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The runtime message that invokes `command`.
pub fn command_message(command: AgentCommand, args: &[String]) -> String {
    let mut message = format!("/command-invoke {}", command.as_str());
    if !args.is_empty() {
        message.push(' ');
        message.push_str(&format_args(args));
    }
    message
}

/// Repository name from a clone URL: last path segment without `.git`.
pub fn repo_name(github_repo_url: &str) -> Option<&str> {
    let last = github_repo_url.trim_end_matches('/').rsplit('/').next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then_some(name)
}

/// Drive one runtime call unless `cancel` fires first. An already-cancelled
/// token returns before the call is polled, so nothing is sent.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = WorkflowResult<T>>,
) -> WorkflowResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
        result = call => result,
    }
}

impl CommandExecutor {
    pub fn new(
        db: DbHandle,
        client: Arc<dyn RuntimeClient>,
        clock: Arc<dyn Clock>,
        config: RuntimeSection,
    ) -> Self {
        Self {
            db,
            client,
            clock,
            config,
        }
    }

    pub fn conversation_id(&self, project_id: i64) -> String {
        format!("{}{}", self.config.conversation_prefix, project_id)
    }

    fn settings(&self) -> QuiescenceSettings {
        QuiescenceSettings {
            poll_interval: self.config.poll_interval(),
            stable_polls: self.config.stable_polls,
            timeout: self.config.timeout(),
        }
    }

    /// Run `command` for the guarded project and wait for the runtime to settle.
    ///
    /// Holding the `ProjectGuard` means no other command or phase transition
    /// for this project is in flight.
    pub async fn execute(
        &self,
        guard: &ProjectGuard,
        command: AgentCommand,
        args: &[String],
        phase_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> WorkflowResult<ExecutionResult> {
        let started = self.clock.now();
        let project_id = guard.project_id();

        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "Project",
                id: project_id,
            })?;

        let args_text = format_args(args);
        let execution = self
            .db
            .call(move |db| {
                let queued = db.create_execution(project_id, phase_id, command, &args_text)?;
                db.mark_execution_running(queued.id, Utc::now())
            })
            .await?;
        let execution_id = execution.id;

        tracing::info!(
            project_id,
            execution_id,
            command = %command,
            "Executing agent command"
        );

        match self.run(&project, command, args, started, cancel).await {
            Ok(output) => {
                let duration = self.clock.now().saturating_duration_since(started);
                let stored = output.clone();
                let execution = self
                    .db
                    .call(move |db| {
                        db.finish_execution(
                            execution_id,
                            ExecutionStatus::Completed,
                            Some(&stored),
                            None,
                            Utc::now(),
                        )
                    })
                    .await?;
                tracing::info!(
                    project_id,
                    execution_id,
                    elapsed_ms = duration.as_millis() as u64,
                    "Agent command completed"
                );
                Ok(ExecutionResult {
                    execution,
                    output,
                    duration,
                })
            }
            Err(WorkflowError::Cancelled) => {
                tracing::warn!(project_id, execution_id, "Agent command cancelled; left running");
                Err(WorkflowError::Cancelled)
            }
            Err(err) => {
                let text = err.record_text();
                tracing::warn!(project_id, execution_id, error = %text, "Agent command failed");
                self.db
                    .call(move |db| {
                        db.finish_execution(
                            execution_id,
                            ExecutionStatus::Failed,
                            None,
                            Some(&text),
                            Utc::now(),
                        )
                    })
                    .await?;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        project: &Project,
        command: AgentCommand,
        args: &[String],
        started: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> WorkflowResult<String> {
        let conversation_id = self.conversation_id(project.id);

        if self.config.clear_before_execute {
            until_cancelled(cancel, self.client.clear_messages(&conversation_id)).await?;
        }

        if let Some(repo) = project.github_repo_url.as_deref().and_then(repo_name) {
            tracing::info!(conversation_id = %conversation_id, repo, "Switching runtime workspace");
            let switch = format!("/repo {}", repo);
            until_cancelled(cancel, self.client.send_message(&conversation_id, &switch)).await?;
        }

        let message = command_message(command, args);
        until_cancelled(cancel, self.client.send_message(&conversation_id, &message)).await?;
        tracing::debug!(conversation_id = %conversation_id, message = %message, "Command sent");

        let client = self.client.clone();
        let poll_id = conversation_id.clone();
        let messages = wait_for_quiescence(
            self.clock.as_ref(),
            self.settings(),
            started,
            cancel,
            move || {
                let client = client.clone();
                let id = poll_id.clone();
                async move {
                    let messages = client.get_messages(&id).await.map_err(|e| {
                        WorkflowError::Execution(format!("Polling runtime failed: {}", e))
                    })?;
                    Ok(messages
                        .into_iter()
                        .filter(RuntimeMessage::is_from_runtime)
                        .collect::<Vec<_>>())
                }
            },
        )
        .await?;

        if let Some(failure) = messages.iter().find(|m| {
            self.config
                .error_markers
                .iter()
                .any(|marker| !marker.is_empty() && m.message.trim_start().starts_with(marker))
        }) {
            return Err(WorkflowError::Execution(failure.message.clone()));
        }

        Ok(messages
            .iter()
            .map(|m| m.message.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Clear the project's conversation on the runtime.
    pub async fn clear_conversation(&self, project_id: i64) -> WorkflowResult<()> {
        self.client
            .clear_messages(&self.conversation_id(project_id))
            .await
    }

    /// Executions of a project, newest first.
    pub async fn command_history(
        &self,
        project_id: i64,
        limit: usize,
    ) -> WorkflowResult<Vec<CommandExecution>> {
        Ok(self
            .db
            .call(move |db| db.list_executions(project_id, limit))
            .await?)
    }

    pub async fn last_successful(
        &self,
        project_id: i64,
        command: AgentCommand,
    ) -> WorkflowResult<Option<CommandExecution>> {
        Ok(self
            .db
            .call(move |db| db.last_successful_execution(project_id, command))
            .await?)
    }

    /// Fail Running executions that started more than one timeout ago, and
    /// their phases. Returns the reconciled executions.
    pub async fn reconcile_stale_executions(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> WorkflowResult<Vec<CommandExecution>> {
        let timeout = chrono::Duration::from_std(self.config.timeout())
            .map_err(|e| WorkflowError::Validation(format!("Invalid runtime timeout: {}", e)))?;
        let cutoff = now - timeout;
        let reconciled = self
            .db
            .call(move |db| {
                let mut done = Vec::new();
                for stale in db.running_executions_started_before(cutoff)? {
                    let text = format!(
                        "{}: execution abandoned while running (process restart)",
                        crate::errors::FailureKind::Execution
                    );
                    let failed = db.finish_execution(
                        stale.id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&text),
                        now,
                    )?;
                    if let Some(phase_id) = stale.phase_id
                        && let Some(phase) = db.get_phase(phase_id)?
                        && phase.status == PhaseStatus::InProgress
                    {
                        db.update_phase_status(phase_id, PhaseStatus::Failed, Some(&text))?;
                    }
                    done.push(failed);
                }
                Ok(done)
            })
            .await?;
        for execution in &reconciled {
            tracing::warn!(
                project_id = execution.project_id,
                execution_id = execution.id,
                "Reconciled stale running execution"
            );
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
pub mod test_support {
    //! Scripted runtime for unit tests.

    use super::*;
    use crate::runtime::types::Direction;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a queue of message-list snapshots; the last one repeats.
    #[derive(Default)]
    pub struct ScriptedRuntime {
        pub sent: Mutex<Vec<String>>,
        pub cleared: Mutex<u32>,
        snapshots: Mutex<VecDeque<Vec<RuntimeMessage>>>,
        last: Mutex<Vec<RuntimeMessage>>,
        pub fail_send_matching: Mutex<Option<String>>,
    }

    pub fn runtime_msg(text: &str) -> RuntimeMessage {
        RuntimeMessage {
            message: text.to_string(),
            timestamp: String::new(),
            direction: Direction::Sent,
        }
    }

    pub fn echo_msg(text: &str) -> RuntimeMessage {
        RuntimeMessage {
            message: text.to_string(),
            timestamp: String::new(),
            direction: Direction::Received,
        }
    }

    impl ScriptedRuntime {
        pub fn new(snapshots: Vec<Vec<RuntimeMessage>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                ..Self::default()
            }
        }

        /// Settle immediately with a single runtime reply.
        pub fn replying(text: &str) -> Self {
            Self::new(vec![vec![runtime_msg(text)]])
        }

        pub fn failing_on(prefix: &str) -> Self {
            let runtime = Self::default();
            *runtime.fail_send_matching.lock().unwrap() = Some(prefix.to_string());
            runtime
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeClient for ScriptedRuntime {
        async fn send_message(&self, _conversation_id: &str, message: &str) -> WorkflowResult<()> {
            if let Some(prefix) = self.fail_send_matching.lock().unwrap().as_deref()
                && message.starts_with(prefix)
            {
                return Err(WorkflowError::Connectivity("connection refused".into()));
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn get_messages(&self, _conversation_id: &str) -> WorkflowResult<Vec<RuntimeMessage>> {
            let mut snapshots = self.snapshots.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = snapshots.pop_front() {
                *last = next;
            }
            Ok(last.clone())
        }

        async fn clear_messages(&self, _conversation_id: &str) -> WorkflowResult<()> {
            *self.cleared.lock().unwrap() += 1;
            Ok(())
        }
    }
}
