use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Format a timestamp the way every table stores it: RFC 3339, UTC, microseconds.
/// Uniform width keeps lexical `ORDER BY` on the column chronological.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Values without an offset (e.g. SQLite's
/// `datetime('now')` output) are interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("Invalid timestamp: {}", s))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Brainstorming,
    VisionReview,
    Planning,
    InProgress,
    Paused,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brainstorming => "brainstorming",
            Self::VisionReview => "vision_review",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brainstorming" => Ok(Self::Brainstorming),
            "vision_review" => Ok(Self::VisionReview),
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Kind of human checkpoint a gate represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    VisionDoc,
    PhaseStart,
    PhaseComplete,
    ErrorResolution,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VisionDoc => "vision_doc",
            Self::PhaseStart => "phase_start",
            Self::PhaseComplete => "phase_complete",
            Self::ErrorResolution => "error_resolution",
        }
    }
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision_doc" => Ok(Self::VisionDoc),
            "phase_start" => Ok(Self::PhaseStart),
            "phase_complete" => Ok(Self::PhaseComplete),
            "error_resolution" => Ok(Self::ErrorResolution),
            _ => Err(format!("Invalid gate type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid gate status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Commands understood by the remote agent runtime.
///
/// The wire name (`as_str`) is what follows `/command-invoke` in the message
/// sent to the runtime and is also the persisted command type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentCommand {
    Prime,
    PlanFeature,
    PlanFeatureGithub,
    Execute,
    ExecuteGithub,
    Validate,
}

impl AgentCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prime => "prime",
            Self::PlanFeature => "plan-feature",
            Self::PlanFeatureGithub => "plan-feature-github",
            Self::Execute => "execute",
            Self::ExecuteGithub => "execute-github",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prime" => Ok(Self::Prime),
            "plan-feature" => Ok(Self::PlanFeature),
            "plan-feature-github" => Ok(Self::PlanFeatureGithub),
            "execute" => Ok(Self::Execute),
            "execute-github" => Ok(Self::ExecuteGithub),
            "validate" => Ok(Self::Validate),
            _ => Err(format!("Unknown agent command: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub github_repo_url: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: i64,
    pub project_id: i64,
    pub phase_number: u32,
    pub name: String,
    pub description: Option<String>,
    pub command: Option<AgentCommand>,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Structured payload shown to a human deciding on a gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub considerations: Option<String>,
}

impl ApprovalRequest {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: i64,
    pub project_id: i64,
    pub phase_id: Option<i64>,
    pub gate_type: GateType,
    pub question: String,
    pub context: ApprovalRequest,
    pub status: GateStatus,
    pub response_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTopic {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub project_id: i64,
    pub topic_id: Option<i64>,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecution {
    pub id: i64,
    pub project_id: i64,
    pub phase_id: Option<i64>,
    pub command: AgentCommand,
    pub args: String,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result tuple returned across the public workflow boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Human-oriented summary of where a project sits in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_phase: String,
    pub next_action: String,
    pub awaiting_approval: bool,
    pub pending_gate_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_project_status_roundtrip() {
        for s in &[
            "brainstorming",
            "vision_review",
            "planning",
            "in_progress",
            "paused",
            "completed",
        ] {
            let parsed: ProjectStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("BRAINSTORMING".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn test_agent_command_wire_names() {
        assert_eq!(AgentCommand::PlanFeatureGithub.as_str(), "plan-feature-github");
        assert_eq!(
            "execute-github".parse::<AgentCommand>().unwrap(),
            AgentCommand::ExecuteGithub
        );
        let err = "deploy".parse::<AgentCommand>().unwrap_err();
        assert!(err.contains("deploy"));
    }

    #[test]
    fn test_agent_command_serde_matches_wire_name() {
        assert_eq!(
            serde_json::to_string(&AgentCommand::PlanFeatureGithub).unwrap(),
            "\"plan-feature-github\""
        );
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_parse_timestamp_naive_is_utc() {
        let naive = parse_timestamp("2026-01-07 11:31:00").unwrap();
        let aware = parse_timestamp("2026-01-07T11:31:00Z").unwrap();
        assert_eq!(naive, aware);
        assert_eq!(naive, Utc.with_ymd_and_hms(2026, 1, 7, 11, 31, 0).unwrap());
    }

    #[test]
    fn test_parse_timestamp_with_offset() {
        let ts = parse_timestamp("2026-01-07T13:31:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 7, 11, 31, 0).unwrap());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_format_timestamp_roundtrips() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 5).unwrap();
        let s = format_timestamp(&ts);
        assert_eq!(s, "2026-03-01T08:00:05.000000Z");
        assert_eq!(parse_timestamp(&s).unwrap(), ts);
    }

    #[test]
    fn test_approval_request_serde_skips_missing_considerations() {
        let req = ApprovalRequest::new("Approve: Plan", "Create a plan");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("considerations").is_none());
        let back: ApprovalRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
