//! Service object wiring the workflow components together.
//!
//! Built once at startup and passed by reference; nothing in the crate keeps
//! global state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::db::{DbHandle, WorkflowDb};
use super::gates::ApprovalGateManager;
use super::locks::ProjectLocks;
use super::models::{
    AgentCommand, ApprovalGate, CommandExecution, ConversationMessage, ConversationTopic,
    MessageRole, Outcome, Project, WorkflowPhase, WorkflowState,
};
use super::pipeline::Pipeline;
use super::state_machine::PhaseStateMachine;
use super::topics::{RecordedMessage, TopicSegmenter};
use crate::config::ConductorToml;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::runtime::client::{HttpRuntimeClient, RuntimeClient};
use crate::runtime::clock::{Clock, TokioClock};
use crate::runtime::executor::CommandExecutor;

pub struct Orchestrator {
    db: DbHandle,
    config: ConductorToml,
    machine: PhaseStateMachine,
    gates: ApprovalGateManager,
    topics: TopicSegmenter,
    executor: Arc<CommandExecutor>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        config: ConductorToml,
        pipeline: Pipeline,
        client: Arc<dyn RuntimeClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gates = ApprovalGateManager::new(db.clone());
        let executor = Arc::new(CommandExecutor::new(
            db.clone(),
            client,
            clock,
            config.runtime.clone(),
        ));
        let machine = PhaseStateMachine::new(
            db.clone(),
            pipeline,
            gates.clone(),
            executor.clone(),
            ProjectLocks::new(),
        );
        let topics = TopicSegmenter::new(db.clone(), &config.topics);
        Self {
            db,
            config,
            machine,
            gates,
            topics,
            executor,
        }
    }

    /// Open the on-disk database for `project_dir` and talk to the runtime over HTTP.
    pub fn open(project_dir: &Path, config: ConductorToml) -> Result<Self> {
        let db_path = config.database_path(project_dir);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let db = WorkflowDb::new(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        let client = HttpRuntimeClient::new(&config.runtime)?;
        tracing::debug!(db = %db_path.display(), runtime = %client.base_url(), "Orchestrator ready");
        Ok(Self::new(
            DbHandle::new(db),
            config,
            Pipeline::default(),
            Arc::new(client),
            Arc::new(TokioClock),
        ))
    }

    pub fn config(&self) -> &ConductorToml {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.machine.pipeline()
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub async fn create_project(
        &self,
        name: &str,
        description: Option<String>,
        github_repo_url: Option<String>,
    ) -> WorkflowResult<Project> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(WorkflowError::Validation(
                "Project name must not be empty".into(),
            ));
        }
        let project = self
            .db
            .call(move |db| {
                db.create_project(&name, description.as_deref(), github_repo_url.as_deref())
            })
            .await?;
        tracing::info!(project_id = project.id, name = %project.name, "Project created");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: i64) -> WorkflowResult<Project> {
        self.db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "Project",
                id: project_id,
            })
    }

    pub async fn list_projects(&self) -> WorkflowResult<Vec<Project>> {
        Ok(self.db.call(|db| db.list_projects()).await?)
    }

    pub async fn phases(&self, project_id: i64) -> WorkflowResult<Vec<WorkflowPhase>> {
        Ok(self.db.call(move |db| db.list_phases(project_id)).await?)
    }

    // ── Workflow ──────────────────────────────────────────────────────

    pub async fn advance(
        &self,
        project_id: i64,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        self.machine.advance(project_id, cancel).await
    }

    pub async fn resolve(
        &self,
        gate_id: i64,
        approved: bool,
        notes: Option<String>,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        self.machine.resolve(gate_id, approved, notes, cancel).await
    }

    pub async fn retry(
        &self,
        project_id: i64,
        cancel: &CancellationToken,
    ) -> WorkflowResult<Outcome> {
        self.machine.retry(project_id, cancel).await
    }

    pub async fn reset_workflow(&self, project_id: i64) -> WorkflowResult<bool> {
        self.machine.reset_workflow(project_id).await
    }

    pub async fn workflow_state(&self, project_id: i64) -> WorkflowResult<WorkflowState> {
        self.machine.workflow_state(project_id).await
    }

    // ── Gates ─────────────────────────────────────────────────────────

    pub async fn pending_gates(&self, project_id: i64) -> WorkflowResult<Vec<ApprovalGate>> {
        self.gates.pending(project_id).await
    }

    pub async fn gate_history(&self, project_id: i64) -> WorkflowResult<Vec<ApprovalGate>> {
        self.gates.history(project_id).await
    }

    /// Expire gates older than `gates.expire_after_hours`. No-op when unset.
    pub async fn expire_stale_gates(
        &self,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<ApprovalGate>> {
        match self.config.gates.expire_after() {
            Some(max_age) => self.gates.expire_stale(now, max_age).await,
            None => Ok(Vec::new()),
        }
    }

    // ── Conversation ──────────────────────────────────────────────────

    pub async fn record_message(
        &self,
        project_id: i64,
        role: MessageRole,
        content: String,
    ) -> WorkflowResult<RecordedMessage> {
        self.topics.record_message(project_id, role, content).await
    }

    /// History with the configured default limit.
    pub async fn history(
        &self,
        project_id: i64,
        active_only: bool,
        limit: Option<usize>,
    ) -> WorkflowResult<Vec<ConversationMessage>> {
        let limit = limit.unwrap_or(self.topics.history_limit());
        self.topics.history(project_id, active_only, limit).await
    }

    pub async fn start_new_topic(
        &self,
        project_id: i64,
        title: Option<String>,
    ) -> WorkflowResult<ConversationTopic> {
        self.get_project(project_id).await?;
        self.topics.start_new_topic(project_id, title, None).await
    }

    pub async fn list_topics(&self, project_id: i64) -> WorkflowResult<Vec<ConversationTopic>> {
        self.topics.list_topics(project_id).await
    }

    pub async fn retitle_topic(&self, topic_id: i64) -> WorkflowResult<ConversationTopic> {
        self.topics.retitle_topic(topic_id).await
    }

    // ── Executions ────────────────────────────────────────────────────

    pub async fn command_history(
        &self,
        project_id: i64,
        limit: usize,
    ) -> WorkflowResult<Vec<CommandExecution>> {
        self.executor.command_history(project_id, limit).await
    }

    pub async fn last_successful(
        &self,
        project_id: i64,
        command: AgentCommand,
    ) -> WorkflowResult<Option<CommandExecution>> {
        self.executor.last_successful(project_id, command).await
    }

    pub async fn clear_conversation(&self, project_id: i64) -> WorkflowResult<()> {
        self.get_project(project_id).await?;
        self.executor.clear_conversation(project_id).await
    }

    pub async fn reconcile_stale_executions(
        &self,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<CommandExecution>> {
        self.executor.reconcile_stale_executions(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::test_support::StepClock;
    use crate::runtime::executor::test_support::ScriptedRuntime;
    use crate::workflow::models::ProjectStatus;
    use tempfile::TempDir;

    fn in_memory(config: ConductorToml) -> Orchestrator {
        Orchestrator::new(
            DbHandle::new(WorkflowDb::new_in_memory().unwrap()),
            config,
            Pipeline::default(),
            Arc::new(ScriptedRuntime::replying("done")),
            Arc::new(StepClock::new()),
        )
    }

    #[tokio::test]
    async fn create_project_rejects_blank_name() {
        let orch = in_memory(ConductorToml::default());
        let err = orch.create_project("   ", None, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(orch.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_default_pipeline_runs_to_completion() {
        let orch = in_memory(ConductorToml::default());
        let project = orch
            .create_project("todo", None, Some("https://github.com/acme/todo".into()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        // Vision gate
        assert!(orch.advance(project.id, &cancel).await.unwrap().success);
        let gate = orch.pending_gates(project.id).await.unwrap()[0].id;
        assert!(orch.resolve(gate, true, None, &cancel).await.unwrap().success);

        // Plan gate, then execute
        assert!(orch.advance(project.id, &cancel).await.unwrap().success);
        let gate = orch.pending_gates(project.id).await.unwrap()[0].id;
        assert!(orch.resolve(gate, true, None, &cancel).await.unwrap().success);

        // Validate gate, then finish
        assert!(orch.advance(project.id, &cancel).await.unwrap().success);
        let gate = orch.pending_gates(project.id).await.unwrap()[0].id;
        let last = orch.resolve(gate, true, None, &cancel).await.unwrap();
        assert!(last.success);
        assert!(last.message.ends_with("Workflow completed successfully!"));

        let phases = orch.phases(project.id).await.unwrap();
        assert_eq!(
            phases.iter().map(|p| p.phase_number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(
            orch.get_project(project.id).await.unwrap().status,
            ProjectStatus::Completed
        );
        assert_eq!(orch.command_history(project.id, 10).await.unwrap().len(), 4);
        assert!(orch
            .last_successful(project.id, AgentCommand::ExecuteGithub)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expiry_is_disabled_without_config() {
        let orch = in_memory(ConductorToml::default());
        let project = orch.create_project("p", None, None).await.unwrap();
        orch.advance(project.id, &CancellationToken::new())
            .await
            .unwrap();
        let far_future = Utc::now() + chrono::Duration::days(365);
        assert!(orch.expire_stale_gates(far_future).await.unwrap().is_empty());

        let mut config = ConductorToml::default();
        config.gates.expire_after_hours = Some(24);
        let orch = in_memory(config);
        let project = orch.create_project("p", None, None).await.unwrap();
        orch.advance(project.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(orch.expire_stale_gates(far_future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_uses_configured_limit() {
        let mut config = ConductorToml::default();
        config.topics.history_limit = 2;
        let orch = in_memory(config);
        let project = orch.create_project("p", None, None).await.unwrap();
        for text in ["a", "b", "c"] {
            orch.record_message(project.id, MessageRole::User, text.into())
                .await
                .unwrap();
        }
        let history = orch.history(project.id, true, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(orch.history(project.id, true, Some(10)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::open(dir.path(), ConductorToml::default()).unwrap();
        orch.create_project("disk", None, None).await.unwrap();
        assert!(dir.path().join(".conductor/conductor.db").exists());
    }
}
