//! Phase state machine.
//!
//! `advance` moves a project to the next pipeline phase; `resolve` settles an
//! approval gate and, on approval, finishes the blocked phase and advances.
//! Both run under the project's advisory lock so phase numbers stay unique and
//! commands are never sent twice. Expected failures come back as
//! `Outcome { success: false, .. }`; only infrastructure errors are `Err`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::db::DbHandle;
use super::gates::ApprovalGateManager;
use super::locks::{ProjectGuard, ProjectLocks};
use super::models::{
    AgentCommand, ApprovalRequest, GateType, Outcome, PhaseStatus, Project, ProjectStatus,
    WorkflowPhase, WorkflowState,
};
use super::pipeline::{PhaseConfig, Pipeline};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::runtime::executor::CommandExecutor;

pub const WORKFLOW_COMPLETED: &str = "Workflow completed successfully!";
pub const APPROVAL_GRANTED: &str = "Approval granted. Continuing workflow...";
pub const APPROVAL_REJECTED: &str = "Approval rejected. Workflow paused.";

/// Arguments passed to the runtime for `command`.
pub fn command_args(command: AgentCommand, project: &Project) -> Vec<String> {
    match command {
        AgentCommand::PlanFeatureGithub => vec![project.name.clone()],
        _ => Vec::new(),
    }
}

pub struct PhaseStateMachine {
    db: DbHandle,
    pipeline: Pipeline,
    gates: ApprovalGateManager,
    executor: Arc<CommandExecutor>,
    locks: ProjectLocks,
}

impl PhaseStateMachine {
    pub fn new(
        db: DbHandle,
        pipeline: Pipeline,
        gates: ApprovalGateManager,
        executor: Arc<CommandExecutor>,
        locks: ProjectLocks,
    ) -> Self {
        Self {
            db,
            pipeline,
            gates,
            executor,
            locks,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Create and run the next phase of the project.
    pub async fn advance(
        &self,
        project_id: i64,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        let guard = self.locks.lock(project_id).await;
        self.advance_locked(&guard, cancel).await
    }

    async fn advance_locked(
        &self,
        guard: &ProjectGuard,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        let project_id = guard.project_id();
        let Some(project) = self.load_project(project_id).await? else {
            return Ok(Outcome::fail("Project not found"));
        };

        let latest = self.db.call(move |db| db.latest_phase(project_id)).await?;
        if let Some(phase) = &latest
            && phase.status != PhaseStatus::Completed
        {
            tracing::warn!(
                project_id,
                phase_number = phase.phase_number,
                status = %phase.status,
                "Refusing to advance past unfinished phase"
            );
            return Ok(Outcome::fail(unfinished_message(phase)));
        }

        let next_number = latest.map(|p| p.phase_number + 1).unwrap_or(1);
        let Some(config) = self.pipeline.get(next_number) else {
            self.db
                .call(move |db| db.update_project_status(project_id, ProjectStatus::Completed))
                .await?;
            tracing::info!(project_id, "Workflow completed");
            return Ok(Outcome::ok(WORKFLOW_COMPLETED));
        };

        let phase = self
            .db
            .call(move |db| {
                let phase = db.create_phase(
                    project_id,
                    config.number,
                    config.name,
                    Some(config.description),
                    config.command,
                )?;
                db.update_project_status(project_id, config.project_status)?;
                Ok(phase)
            })
            .await?;
        tracing::info!(
            project_id,
            phase_number = phase.phase_number,
            phase = %phase.name,
            "Phase created"
        );

        if config.gate().is_some() {
            return self.block_on_gate(&phase, config).await;
        }
        if let Some(command) = config.command {
            return self
                .run_command_phase(guard, &project, &phase, command, cancel)
                .await;
        }

        self.set_phase_status(phase.id, PhaseStatus::Completed, None)
            .await?;
        Ok(Outcome::ok(format!("Advanced to phase: {}", config.name)))
    }

    /// Open the phase's gate and park the phase as Blocked.
    async fn block_on_gate(
        &self,
        phase: &WorkflowPhase,
        config: &PhaseConfig,
    ) -> WorkflowResult<Outcome> {
        let gate_type = config.gate().unwrap_or(GateType::PhaseStart);
        let mut request =
            ApprovalRequest::new(format!("Approve: {}", config.name), config.description);
        request
            .details
            .insert("phase_number".into(), serde_json::json!(phase.phase_number));
        if let Some(command) = config.command {
            request
                .details
                .insert("command".into(), serde_json::json!(command.as_str()));
            request.considerations = Some(format!(
                "Approving runs `/command-invoke {}` on the agent runtime.",
                command
            ));
        }

        let gate = self
            .gates
            .open(phase.project_id, Some(phase.id), gate_type, request)
            .await?;
        self.set_phase_status(phase.id, PhaseStatus::Blocked, None)
            .await?;
        tracing::info!(
            project_id = phase.project_id,
            phase_number = phase.phase_number,
            gate_id = gate.id,
            "Phase blocked on approval"
        );
        Ok(Outcome::ok(format!("Created approval gate for: {}", config.name)))
    }

    /// Run a phase's command on the runtime and record the result on the phase.
    async fn run_command_phase(
        &self,
        guard: &ProjectGuard,
        project: &Project,
        phase: &WorkflowPhase,
        command: AgentCommand,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        self.set_phase_status(phase.id, PhaseStatus::InProgress, None)
            .await?;
        let args = command_args(command, project);

        match self
            .executor
            .execute(guard, command, &args, Some(phase.id), cancel)
            .await
        {
            Ok(result) => {
                self.set_phase_status(phase.id, PhaseStatus::Completed, None)
                    .await?;
                tracing::info!(
                    project_id = project.id,
                    phase_number = phase.phase_number,
                    "Phase completed"
                );
                Ok(Outcome::ok(format!(
                    "Completed phase: {}\n{}",
                    phase.name, result.output
                )))
            }
            Err(WorkflowError::Cancelled) => {
                tracing::warn!(
                    project_id = project.id,
                    phase_number = phase.phase_number,
                    "Phase cancelled while running"
                );
                Ok(Outcome::fail(format!(
                    "Phase cancelled: {} (left in progress for reconciliation)",
                    phase.name
                )))
            }
            Err(err @ WorkflowError::Database(_)) => Err(err),
            Err(err) => {
                let text = err.record_text();
                self.set_phase_status(phase.id, PhaseStatus::Failed, Some(text))
                    .await?;
                tracing::warn!(
                    project_id = project.id,
                    phase_number = phase.phase_number,
                    error = %err,
                    "Phase failed"
                );
                Ok(Outcome::fail(format!("Phase failed: {}", err)))
            }
        }
    }

    /// Approve or reject a gate. Approval finishes the blocked phase (running
    /// its command if it has one) and advances the workflow.
    pub async fn resolve(
        &self,
        gate_id: i64,
        approved: bool,
        notes: Option<String>,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        let gate = match self.gates.get(gate_id).await {
            Ok(gate) => gate,
            Err(WorkflowError::NotFound { .. }) => {
                return Ok(Outcome::fail("Approval gate not found"));
            }
            Err(err) => return Err(err),
        };
        let guard = self.locks.lock(gate.project_id).await;

        let gate = match self.gates.transition(gate_id, approved, notes).await {
            Ok(gate) => gate,
            Err(WorkflowError::Validation(message)) => return Ok(Outcome::fail(message)),
            Err(WorkflowError::NotFound { .. }) => {
                return Ok(Outcome::fail("Approval gate not found"));
            }
            Err(err) => return Err(err),
        };
        let project_id = gate.project_id;

        if !approved {
            self.db
                .call(move |db| db.update_project_status(project_id, ProjectStatus::Paused))
                .await?;
            tracing::info!(project_id, gate_id, "Workflow paused by rejection");
            return Ok(Outcome::fail(APPROVAL_REJECTED));
        }

        let mut message = APPROVAL_GRANTED.to_string();
        if let Some(phase_id) = gate.phase_id
            && let Some(phase) = self.db.call(move |db| db.get_phase(phase_id)).await?
            && phase.status == PhaseStatus::Blocked
        {
            match phase.command {
                Some(command) => {
                    let Some(project) = self.load_project(project_id).await? else {
                        return Ok(Outcome::fail("Project not found"));
                    };
                    let outcome = self
                        .run_command_phase(&guard, &project, &phase, command, cancel)
                        .await?;
                    message.push('\n');
                    message.push_str(&outcome.message);
                    if !outcome.success {
                        return Ok(Outcome::fail(message));
                    }
                }
                None => {
                    self.set_phase_status(phase.id, PhaseStatus::Completed, None)
                        .await?;
                }
            }
        }

        let next = self.advance_locked(&guard, cancel).await?;
        message.push('\n');
        message.push_str(&next.message);
        Ok(Outcome {
            success: next.success,
            message,
        })
    }

    /// Recover a stuck project: re-run a Failed phase in place, or reopen the
    /// gate of a Blocked phase whose gate was rejected or expired.
    pub async fn retry(
        &self,
        project_id: i64,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        let guard = self.locks.lock(project_id).await;
        let Some(project) = self.load_project(project_id).await? else {
            return Ok(Outcome::fail("Project not found"));
        };
        let Some(phase) = self.db.call(move |db| db.latest_phase(project_id)).await? else {
            return Ok(Outcome::fail("No phase to retry"));
        };
        let config = self.pipeline.get(phase.phase_number);

        match phase.status {
            PhaseStatus::Failed => {
                tracing::info!(project_id, phase_number = phase.phase_number, "Retrying phase");
                if let Some(config) = config {
                    self.set_project_status(project_id, config.project_status)
                        .await?;
                }
                match phase.command {
                    Some(command) => {
                        self.run_command_phase(&guard, &project, &phase, command, cancel)
                            .await
                    }
                    None => {
                        self.set_phase_status(phase.id, PhaseStatus::Completed, None)
                            .await?;
                        Ok(Outcome::ok(format!("Advanced to phase: {}", phase.name)))
                    }
                }
            }
            PhaseStatus::Blocked => {
                let pending = self.gates.pending(project_id).await?;
                if let Some(gate) = pending.iter().find(|g| g.phase_id == Some(phase.id)) {
                    return Ok(Outcome::fail(format!(
                        "Phase {} ({}) is awaiting approval on gate {}",
                        phase.phase_number, phase.name, gate.id
                    )));
                }
                match config {
                    Some(config) => {
                        self.set_project_status(project_id, config.project_status)
                            .await?;
                        self.block_on_gate(&phase, config).await
                    }
                    None => Ok(Outcome::fail(format!(
                        "Phase {} is not part of the pipeline",
                        phase.phase_number
                    ))),
                }
            }
            _ => Ok(Outcome::fail(format!(
                "Phase {} ({}) is {}; nothing to retry",
                phase.phase_number, phase.name, phase.status
            ))),
        }
    }

    /// Put the project back in Brainstorming. Phase history is kept.
    pub async fn reset_workflow(&self, project_id: i64) -> WorkflowResult<bool> {
        let _guard = self.locks.lock(project_id).await;
        if self.load_project(project_id).await?.is_none() {
            return Ok(false);
        }
        self.db
            .call(move |db| db.update_project_status(project_id, ProjectStatus::Brainstorming))
            .await?;
        tracing::info!(project_id, "Workflow reset");
        Ok(true)
    }

    /// Where the project stands and what should happen next.
    pub async fn workflow_state(&self, project_id: i64) -> WorkflowResult<WorkflowState> {
        let project = self
            .load_project(project_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "Project",
                id: project_id,
            })?;
        let latest = self.db.call(move |db| db.latest_phase(project_id)).await?;
        let pending = self.gates.pending(project_id).await?;

        if project.status == ProjectStatus::Completed {
            return Ok(WorkflowState {
                current_phase: "Completed".into(),
                next_action: "Project implementation complete!".into(),
                awaiting_approval: false,
                pending_gate_id: None,
            });
        }
        if let Some(gate) = pending.first() {
            return Ok(WorkflowState {
                current_phase: latest
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| project.status.to_string()),
                next_action: format!("Awaiting approval: {}", gate.question),
                awaiting_approval: true,
                pending_gate_id: Some(gate.id),
            });
        }

        let (current_phase, next_action) = match latest {
            None => (
                "Brainstorming".to_string(),
                match self.pipeline.get(1) {
                    Some(first) => format!("Advance to start: {}", first.name),
                    None => "Advance to finish the workflow".to_string(),
                },
            ),
            Some(phase) => {
                let action = match phase.status {
                    PhaseStatus::Failed => format!("Retry failed phase: {}", phase.name),
                    PhaseStatus::Blocked => {
                        "Workflow paused; retry to reopen the approval gate".to_string()
                    }
                    PhaseStatus::InProgress | PhaseStatus::Pending => match phase.command {
                        Some(command) => format!("Waiting for {} to finish", command),
                        None => format!("Waiting for {} to finish", phase.name),
                    },
                    PhaseStatus::Completed => match self.pipeline.get(phase.phase_number + 1) {
                        Some(next) => match next.command {
                            Some(command) => {
                                format!("Advance to: {} ({})", next.name, command)
                            }
                            None => format!("Advance to: {}", next.name),
                        },
                        None => "Advance to finish the workflow".to_string(),
                    },
                };
                (phase.name, action)
            }
        };

        Ok(WorkflowState {
            current_phase,
            next_action,
            awaiting_approval: false,
            pending_gate_id: None,
        })
    }

    async fn load_project(&self, project_id: i64) -> WorkflowResult<Option<Project>> {
        Ok(self.db.call(move |db| db.get_project(project_id)).await?)
    }

    async fn set_project_status(
        &self,
        project_id: i64,
        status: ProjectStatus,
    ) -> WorkflowResult<()> {
        self.db
            .call(move |db| db.update_project_status(project_id, status))
            .await?;
        Ok(())
    }

    async fn set_phase_status(
        &self,
        phase_id: i64,
        status: PhaseStatus,
        error: Option<String>,
    ) -> WorkflowResult<WorkflowPhase> {
        Ok(self
            .db
            .call(move |db| db.update_phase_status(phase_id, status, error.as_deref()))
            .await?)
    }
}

fn unfinished_message(phase: &WorkflowPhase) -> String {
    match phase.status {
        PhaseStatus::Blocked => format!(
            "Phase {} ({}) is awaiting approval",
            phase.phase_number, phase.name
        ),
        PhaseStatus::Failed => format!(
            "Phase {} ({}) failed; retry it before advancing",
            phase.phase_number, phase.name
        ),
        status => format!(
            "Phase {} ({}) is still {}",
            phase.phase_number, phase.name, status
        ),
    }
}
