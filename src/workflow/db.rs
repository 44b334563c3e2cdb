use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the workflow database.
///
/// Wraps `WorkflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. A closure passed to `call` holds
/// the connection for its whole body, so multi-statement read-decide-write
/// sequences inside one closure are serialized against every other writer.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkflowDb>>,
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkflowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, WorkflowDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct WorkflowDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str =
    "id, name, description, github_repo_url, status, created_at, updated_at";
const PHASE_COLUMNS: &str = "id, project_id, phase_number, name, description, command, status, started_at, completed_at, error, created_at";
const GATE_COLUMNS: &str = "id, project_id, phase_id, gate_type, question, context, status, response_notes, resolved_at, created_at";
const TOPIC_COLUMNS: &str = "id, project_id, title, summary, started_at, ended_at, is_active";
const MESSAGE_COLUMNS: &str = "id, project_id, topic_id, role, content, timestamp";
const EXECUTION_COLUMNS: &str = "id, project_id, phase_id, command, args, status, output, error, started_at, completed_at";

impl WorkflowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT,
                    github_repo_url TEXT,
                    status TEXT NOT NULL DEFAULT 'brainstorming',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_phases (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    phase_number INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    command TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    completed_at TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(project_id, phase_number)
                );

                CREATE TABLE IF NOT EXISTS approval_gates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    phase_id INTEGER REFERENCES workflow_phases(id) ON DELETE SET NULL,
                    gate_type TEXT NOT NULL,
                    question TEXT NOT NULL,
                    context TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    response_notes TEXT,
                    resolved_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversation_topics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    summary TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS conversation_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    topic_id INTEGER REFERENCES conversation_topics(id),
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS command_executions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    phase_id INTEGER REFERENCES workflow_phases(id) ON DELETE SET NULL,
                    command TEXT NOT NULL,
                    args TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'queued',
                    output TEXT,
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_phases_project ON workflow_phases(project_id);
                CREATE INDEX IF NOT EXISTS idx_gates_project_status ON approval_gates(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_topics_project_active ON conversation_topics(project_id, is_active);
                CREATE INDEX IF NOT EXISTS idx_messages_topic ON conversation_messages(topic_id);
                CREATE INDEX IF NOT EXISTS idx_messages_project ON conversation_messages(project_id);
                CREATE INDEX IF NOT EXISTS idx_executions_project ON command_executions(project_id);

                -- Only one active topic per project at a time
                CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_topic
                    ON conversation_topics(project_id) WHERE is_active = 1;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        github_repo_url: Option<&str>,
    ) -> Result<Project> {
        let now = format_timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO projects (name, description, github_repo_url, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    name,
                    description,
                    github_repo_url,
                    ProjectStatus::Brainstorming.as_str(),
                    now
                ],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn update_project_status(&self, id: i64, status: ProjectStatus) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), format_timestamp(&Utc::now()), id],
            )
            .context("Failed to update project status")?;
        self.get_project(id)?
            .context("Project not found after status update")
    }

    // ── Workflow phases ───────────────────────────────────────────────

    /// Highest-numbered phase of the project, if any.
    pub fn latest_phase(&self, project_id: i64) -> Result<Option<WorkflowPhase>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_phases WHERE project_id = ?1
                     ORDER BY phase_number DESC LIMIT 1",
                    PHASE_COLUMNS
                ),
                params![project_id],
                PhaseRow::from_row,
            )
            .optional()
            .context("Failed to query latest phase")?;
        row.map(PhaseRow::into_phase).transpose()
    }

    pub fn create_phase(
        &self,
        project_id: i64,
        phase_number: u32,
        name: &str,
        description: Option<&str>,
        command: Option<AgentCommand>,
    ) -> Result<WorkflowPhase> {
        self.conn
            .execute(
                "INSERT INTO workflow_phases (project_id, phase_number, name, description, command, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    phase_number,
                    name,
                    description,
                    command.map(|c| c.as_str()),
                    PhaseStatus::Pending.as_str(),
                    format_timestamp(&Utc::now()),
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to insert phase {} for project {}",
                    phase_number, project_id
                )
            })?;
        let id = self.conn.last_insert_rowid();
        self.get_phase(id)?.context("Phase not found after insert")
    }

    pub fn get_phase(&self, id: i64) -> Result<Option<WorkflowPhase>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM workflow_phases WHERE id = ?1", PHASE_COLUMNS),
                params![id],
                PhaseRow::from_row,
            )
            .optional()
            .context("Failed to query phase")?;
        row.map(PhaseRow::into_phase).transpose()
    }

    pub fn list_phases(&self, project_id: i64) -> Result<Vec<WorkflowPhase>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM workflow_phases WHERE project_id = ?1 ORDER BY phase_number ASC",
                PHASE_COLUMNS
            ))
            .context("Failed to prepare list_phases")?;
        let rows = stmt
            .query_map(params![project_id], PhaseRow::from_row)
            .context("Failed to query phases")?;
        let mut phases = Vec::new();
        for row in rows {
            phases.push(row.context("Failed to read phase row")?.into_phase()?);
        }
        Ok(phases)
    }

    /// Set a phase's status. `started_at` is stamped on the first move to
    /// InProgress, `completed_at` on Completed/Failed. The error column is
    /// replaced by `error` (cleared when `None`).
    pub fn update_phase_status(
        &self,
        id: i64,
        status: PhaseStatus,
        error: Option<&str>,
    ) -> Result<WorkflowPhase> {
        let now = format_timestamp(&Utc::now());
        self.conn
            .execute(
                "UPDATE workflow_phases SET
                    status = ?1,
                    error = ?2,
                    started_at = CASE WHEN ?1 = 'in_progress' THEN COALESCE(started_at, ?3) ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?3 ELSE completed_at END
                 WHERE id = ?4",
                params![status.as_str(), error, now, id],
            )
            .context("Failed to update phase status")?;
        self.get_phase(id)?
            .context("Phase not found after status update")
    }

    // ── Approval gates ────────────────────────────────────────────────

    pub fn create_gate(
        &self,
        project_id: i64,
        phase_id: Option<i64>,
        gate_type: GateType,
        request: &ApprovalRequest,
    ) -> Result<ApprovalGate> {
        let context =
            serde_json::to_string(request).context("Failed to serialize approval request")?;
        self.conn
            .execute(
                "INSERT INTO approval_gates (project_id, phase_id, gate_type, question, context, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    phase_id,
                    gate_type.as_str(),
                    request.title,
                    context,
                    GateStatus::Pending.as_str(),
                    format_timestamp(&Utc::now()),
                ],
            )
            .context("Failed to insert approval gate")?;
        let id = self.conn.last_insert_rowid();
        self.get_gate(id)?.context("Gate not found after insert")
    }

    pub fn get_gate(&self, id: i64) -> Result<Option<ApprovalGate>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM approval_gates WHERE id = ?1", GATE_COLUMNS),
                params![id],
                GateRow::from_row,
            )
            .optional()
            .context("Failed to query approval gate")?;
        row.map(GateRow::into_gate).transpose()
    }

    /// Move a gate out of Pending. The update only matches a Pending row, so a
    /// second resolution changes nothing; returns `None` in that case.
    pub fn resolve_gate(
        &self,
        id: i64,
        status: GateStatus,
        notes: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<ApprovalGate>> {
        let changed = self
            .conn
            .execute(
                "UPDATE approval_gates SET status = ?1, response_notes = ?2, resolved_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![status.as_str(), notes, format_timestamp(&resolved_at), id],
            )
            .context("Failed to resolve approval gate")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_gate(id)
    }

    /// Pending gates of a project, oldest first.
    pub fn pending_gates(&self, project_id: i64) -> Result<Vec<ApprovalGate>> {
        self.query_gates(
            &format!(
                "SELECT {} FROM approval_gates WHERE project_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, id ASC",
                GATE_COLUMNS
            ),
            params![project_id],
        )
    }

    /// Every gate of a project, newest first.
    pub fn gate_history(&self, project_id: i64) -> Result<Vec<ApprovalGate>> {
        self.query_gates(
            &format!(
                "SELECT {} FROM approval_gates WHERE project_id = ?1
                 ORDER BY created_at DESC, id DESC",
                GATE_COLUMNS
            ),
            params![project_id],
        )
    }

    /// Pending gates (any project) created strictly before `cutoff`.
    pub fn pending_gates_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ApprovalGate>> {
        self.query_gates(
            &format!(
                "SELECT {} FROM approval_gates WHERE status = 'pending' AND created_at < ?1
                 ORDER BY created_at ASC, id ASC",
                GATE_COLUMNS
            ),
            params![format_timestamp(&cutoff)],
        )
    }

    fn query_gates(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ApprovalGate>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare gate query")?;
        let rows = stmt
            .query_map(params, GateRow::from_row)
            .context("Failed to query approval gates")?;
        let mut gates = Vec::new();
        for row in rows {
            gates.push(row.context("Failed to read gate row")?.into_gate()?);
        }
        Ok(gates)
    }

    // ── Conversation topics ───────────────────────────────────────────

    /// The authoritative active topic: if more than one row is flagged active,
    /// the most recently started one wins.
    pub fn active_topic(&self, project_id: i64) -> Result<Option<ConversationTopic>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversation_topics WHERE project_id = ?1 AND is_active = 1
                     ORDER BY started_at DESC, id DESC LIMIT 1",
                    TOPIC_COLUMNS
                ),
                params![project_id],
                TopicRow::from_row,
            )
            .optional()
            .context("Failed to query active topic")?;
        row.map(TopicRow::into_topic).transpose()
    }

    /// End every active topic of the project and insert a new active one, in
    /// a single transaction.
    pub fn start_new_topic(
        &self,
        project_id: i64,
        title: &str,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ConversationTopic> {
        let now = format_timestamp(&now);
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin topic transaction")?;
        tx.execute(
            "UPDATE conversation_topics SET is_active = 0, ended_at = ?1
             WHERE project_id = ?2 AND is_active = 1",
            params![now, project_id],
        )
        .context("Failed to end active topic")?;
        tx.execute(
            "INSERT INTO conversation_topics (project_id, title, summary, started_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![project_id, title, summary, now],
        )
        .context("Failed to insert topic")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit topic switch")?;
        self.get_topic(id)?.context("Topic not found after insert")
    }

    pub fn get_topic(&self, id: i64) -> Result<Option<ConversationTopic>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM conversation_topics WHERE id = ?1", TOPIC_COLUMNS),
                params![id],
                TopicRow::from_row,
            )
            .optional()
            .context("Failed to query topic")?;
        row.map(TopicRow::into_topic).transpose()
    }

    /// Topics of a project, newest first.
    pub fn list_topics(&self, project_id: i64) -> Result<Vec<ConversationTopic>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM conversation_topics WHERE project_id = ?1
                 ORDER BY started_at DESC, id DESC",
                TOPIC_COLUMNS
            ))
            .context("Failed to prepare list_topics")?;
        let rows = stmt
            .query_map(params![project_id], TopicRow::from_row)
            .context("Failed to query topics")?;
        let mut topics = Vec::new();
        for row in rows {
            topics.push(row.context("Failed to read topic row")?.into_topic()?);
        }
        Ok(topics)
    }

    pub fn update_topic_title(&self, id: i64, title: &str) -> Result<ConversationTopic> {
        self.conn
            .execute(
                "UPDATE conversation_topics SET title = ?1 WHERE id = ?2",
                params![title, id],
            )
            .context("Failed to update topic title")?;
        self.get_topic(id)?
            .context("Topic not found after title update")
    }

    // ── Conversation messages ─────────────────────────────────────────

    pub fn insert_message(
        &self,
        project_id: i64,
        topic_id: i64,
        role: MessageRole,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ConversationMessage> {
        self.conn
            .execute(
                "INSERT INTO conversation_messages (project_id, topic_id, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    topic_id,
                    role.as_str(),
                    content,
                    format_timestamp(&timestamp)
                ],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM conversation_messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                MessageRow::from_row,
            )
            .context("Message not found after insert")?;
        row.into_message()
    }

    /// Most recent message attached to a topic.
    pub fn last_message_in_topic(&self, topic_id: i64) -> Result<Option<ConversationMessage>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversation_messages WHERE topic_id = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![topic_id],
                MessageRow::from_row,
            )
            .optional()
            .context("Failed to query last message")?;
        row.map(MessageRow::into_message).transpose()
    }

    /// First `limit` messages of a topic, oldest first.
    pub fn first_messages_in_topic(
        &self,
        topic_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM conversation_messages WHERE topic_id = ?1
                 ORDER BY timestamp ASC, id ASC LIMIT ?2",
                MESSAGE_COLUMNS
            ),
            params![topic_id, limit as i64],
        )
    }

    /// The latest `limit` messages of a topic, returned oldest first.
    pub fn recent_messages_in_topic(
        &self,
        topic_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        self.query_messages(
            &format!(
                "SELECT {cols} FROM (
                    SELECT {cols} FROM conversation_messages WHERE topic_id = ?1
                    ORDER BY timestamp DESC, id DESC LIMIT ?2
                 ) ORDER BY timestamp ASC, id ASC",
                cols = MESSAGE_COLUMNS
            ),
            params![topic_id, limit as i64],
        )
    }

    /// The latest `limit` messages of a project across all topics, oldest first.
    pub fn recent_messages_in_project(
        &self,
        project_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        self.query_messages(
            &format!(
                "SELECT {cols} FROM (
                    SELECT {cols} FROM conversation_messages WHERE project_id = ?1
                    ORDER BY timestamp DESC, id DESC LIMIT ?2
                 ) ORDER BY timestamp ASC, id ASC",
                cols = MESSAGE_COLUMNS
            ),
            params![project_id, limit as i64],
        )
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ConversationMessage>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(messages)
    }

    // ── Command executions ────────────────────────────────────────────

    pub fn create_execution(
        &self,
        project_id: i64,
        phase_id: Option<i64>,
        command: AgentCommand,
        args: &str,
    ) -> Result<CommandExecution> {
        self.conn
            .execute(
                "INSERT INTO command_executions (project_id, phase_id, command, args, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    phase_id,
                    command.as_str(),
                    args,
                    ExecutionStatus::Queued.as_str()
                ],
            )
            .context("Failed to insert command execution")?;
        let id = self.conn.last_insert_rowid();
        self.get_execution(id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<CommandExecution>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM command_executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                ExecutionRow::from_row,
            )
            .optional()
            .context("Failed to query command execution")?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    /// Queued → Running. Fails if the row is not Queued.
    pub fn mark_execution_running(
        &self,
        id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<CommandExecution> {
        let changed = self
            .conn
            .execute(
                "UPDATE command_executions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![format_timestamp(&started_at), id],
            )
            .context("Failed to mark execution running")?;
        if changed == 0 {
            anyhow::bail!("Execution {} is not queued", id);
        }
        self.get_execution(id)?
            .context("Execution not found after update")
    }

    /// Running → Completed/Failed, exactly once. Fails if the row is not
    /// Running or `status` is not terminal.
    pub fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<CommandExecution> {
        if !status.is_terminal() {
            anyhow::bail!("Cannot finish execution {} with status {}", id, status);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE command_executions SET status = ?1, output = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![
                    status.as_str(),
                    output,
                    error,
                    format_timestamp(&completed_at),
                    id
                ],
            )
            .context("Failed to finish execution")?;
        if changed == 0 {
            anyhow::bail!("Execution {} is not running", id);
        }
        self.get_execution(id)?
            .context("Execution not found after update")
    }

    /// Executions of a project, newest first.
    pub fn list_executions(&self, project_id: i64, limit: usize) -> Result<Vec<CommandExecution>> {
        self.query_executions(
            &format!(
                "SELECT {} FROM command_executions WHERE project_id = ?1
                 ORDER BY id DESC LIMIT ?2",
                EXECUTION_COLUMNS
            ),
            params![project_id, limit as i64],
        )
    }

    pub fn last_successful_execution(
        &self,
        project_id: i64,
        command: AgentCommand,
    ) -> Result<Option<CommandExecution>> {
        let mut found = self.query_executions(
            &format!(
                "SELECT {} FROM command_executions
                 WHERE project_id = ?1 AND command = ?2 AND status = 'completed'
                 ORDER BY completed_at DESC, id DESC LIMIT 1",
                EXECUTION_COLUMNS
            ),
            params![project_id, command.as_str()],
        )?;
        Ok(found.pop())
    }

    /// Running executions whose start precedes `cutoff`.
    pub fn running_executions_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CommandExecution>> {
        self.query_executions(
            &format!(
                "SELECT {} FROM command_executions
                 WHERE status = 'running' AND started_at < ?1 ORDER BY id ASC",
                EXECUTION_COLUMNS
            ),
            params![format_timestamp(&cutoff)],
        )
    }

    fn query_executions(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<CommandExecution>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare execution query")?;
        let rows = stmt
            .query_map(params, ExecutionRow::from_row)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.context("Failed to read execution row")?.into_execution()?);
        }
        Ok(executions)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

fn parse_ts(value: &str, what: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

fn parse_opt_ts(value: Option<String>, what: &str) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(|v| parse_ts(v, what)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

/// Intermediate row struct for projects.
struct ProjectRow {
    id: i64,
    name: String,
    description: Option<String>,
    github_repo_url: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            github_repo_url: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: self.id,
            name: self.name,
            description: self.description,
            github_repo_url: self.github_repo_url,
            status: parse_enum(&self.status, "project status")?,
            created_at: parse_ts(&self.created_at, "project created_at")?,
            updated_at: parse_ts(&self.updated_at, "project updated_at")?,
        })
    }
}

/// Intermediate row struct for workflow_phases.
struct PhaseRow {
    id: i64,
    project_id: i64,
    phase_number: u32,
    name: String,
    description: Option<String>,
    command: Option<String>,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl PhaseRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            phase_number: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            command: row.get(5)?,
            status: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_phase(self) -> Result<WorkflowPhase> {
        let command = self
            .command
            .as_deref()
            .map(|c| parse_enum::<AgentCommand>(c, "phase command"))
            .transpose()?;
        Ok(WorkflowPhase {
            id: self.id,
            project_id: self.project_id,
            phase_number: self.phase_number,
            name: self.name,
            description: self.description,
            command,
            status: parse_enum(&self.status, "phase status")?,
            started_at: parse_opt_ts(self.started_at, "phase started_at")?,
            completed_at: parse_opt_ts(self.completed_at, "phase completed_at")?,
            error: self.error,
            created_at: parse_ts(&self.created_at, "phase created_at")?,
        })
    }
}

/// Intermediate row struct for approval_gates.
struct GateRow {
    id: i64,
    project_id: i64,
    phase_id: Option<i64>,
    gate_type: String,
    question: String,
    context: String,
    status: String,
    response_notes: Option<String>,
    resolved_at: Option<String>,
    created_at: String,
}

impl GateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            phase_id: row.get(2)?,
            gate_type: row.get(3)?,
            question: row.get(4)?,
            context: row.get(5)?,
            status: row.get(6)?,
            response_notes: row.get(7)?,
            resolved_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_gate(self) -> Result<ApprovalGate> {
        let context: ApprovalRequest = serde_json::from_str(&self.context)
            .context("Failed to parse approval gate context")?;
        Ok(ApprovalGate {
            id: self.id,
            project_id: self.project_id,
            phase_id: self.phase_id,
            gate_type: parse_enum(&self.gate_type, "gate type")?,
            question: self.question,
            context,
            status: parse_enum(&self.status, "gate status")?,
            response_notes: self.response_notes,
            resolved_at: parse_opt_ts(self.resolved_at, "gate resolved_at")?,
            created_at: parse_ts(&self.created_at, "gate created_at")?,
        })
    }
}

/// Intermediate row struct for conversation_topics.
struct TopicRow {
    id: i64,
    project_id: i64,
    title: String,
    summary: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    is_active: bool,
}

impl TopicRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            summary: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            is_active: row.get(6)?,
        })
    }

    fn into_topic(self) -> Result<ConversationTopic> {
        Ok(ConversationTopic {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            summary: self.summary,
            started_at: parse_ts(&self.started_at, "topic started_at")?,
            ended_at: parse_opt_ts(self.ended_at, "topic ended_at")?,
            is_active: self.is_active,
        })
    }
}

/// Intermediate row struct for conversation_messages.
struct MessageRow {
    id: i64,
    project_id: i64,
    topic_id: Option<i64>,
    role: String,
    content: String,
    timestamp: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            topic_id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_message(self) -> Result<ConversationMessage> {
        Ok(ConversationMessage {
            id: self.id,
            project_id: self.project_id,
            topic_id: self.topic_id,
            role: parse_enum(&self.role, "message role")?,
            content: self.content,
            timestamp: parse_ts(&self.timestamp, "message timestamp")?,
        })
    }
}

/// Intermediate row struct for command_executions.
struct ExecutionRow {
    id: i64,
    project_id: i64,
    phase_id: Option<i64>,
    command: String,
    args: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            phase_id: row.get(2)?,
            command: row.get(3)?,
            args: row.get(4)?,
            status: row.get(5)?,
            output: row.get(6)?,
            error: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_execution(self) -> Result<CommandExecution> {
        Ok(CommandExecution {
            id: self.id,
            project_id: self.project_id,
            phase_id: self.phase_id,
            command: parse_enum(&self.command, "execution command")?,
            args: self.args,
            status: parse_enum(&self.status, "execution status")?,
            output: self.output,
            error: self.error,
            started_at: parse_opt_ts(self.started_at, "execution started_at")?,
            completed_at: parse_opt_ts(self.completed_at, "execution completed_at")?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
