//! Approval gates: human checkpoints that block a phase until resolved.
//!
//! A gate is resolved at most once. Every transition out of Pending is a
//! conditional update on `status = 'pending'`, so two racing resolutions can
//! never both succeed.

use chrono::{DateTime, Utc};

use super::db::DbHandle;
use super::models::{ApprovalGate, ApprovalRequest, GateStatus, GateType, ProjectStatus};
use crate::errors::{WorkflowError, WorkflowResult};

pub const DEFAULT_REJECTION_NOTES: &str = "User rejected";

#[derive(Clone)]
pub struct ApprovalGateManager {
    db: DbHandle,
}

impl ApprovalGateManager {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Create a Pending gate.
    pub async fn open(
        &self,
        project_id: i64,
        phase_id: Option<i64>,
        gate_type: GateType,
        request: ApprovalRequest,
    ) -> WorkflowResult<ApprovalGate> {
        let gate = self
            .db
            .call(move |db| db.create_gate(project_id, phase_id, gate_type, &request))
            .await?;
        tracing::info!(
            project_id,
            gate_id = gate.id,
            gate_type = %gate_type,
            "Approval gate opened"
        );
        Ok(gate)
    }

    pub async fn get(&self, gate_id: i64) -> WorkflowResult<ApprovalGate> {
        self.db
            .call(move |db| db.get_gate(gate_id))
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "Approval gate",
                id: gate_id,
            })
    }

    /// Approve or reject a Pending gate. Rejections without notes are
    /// recorded as "User rejected".
    pub async fn transition(
        &self,
        gate_id: i64,
        approved: bool,
        notes: Option<String>,
    ) -> WorkflowResult<ApprovalGate> {
        let gate = self.get(gate_id).await?;
        if gate.status != GateStatus::Pending {
            return Err(WorkflowError::Validation(format!(
                "Gate already {}",
                gate.status
            )));
        }

        let (status, notes) = if approved {
            (GateStatus::Approved, notes)
        } else {
            (
                GateStatus::Rejected,
                Some(notes.unwrap_or_else(|| DEFAULT_REJECTION_NOTES.to_string())),
            )
        };

        let resolved = self
            .db
            .call(move |db| db.resolve_gate(gate_id, status, notes.as_deref(), Utc::now()))
            .await?
            .ok_or_else(|| WorkflowError::Validation("Gate already resolved".to_string()))?;

        tracing::info!(
            project_id = resolved.project_id,
            gate_id,
            status = %resolved.status,
            "Approval gate resolved"
        );
        Ok(resolved)
    }

    /// Pending gates for a project, oldest first.
    pub async fn pending(&self, project_id: i64) -> WorkflowResult<Vec<ApprovalGate>> {
        Ok(self.db.call(move |db| db.pending_gates(project_id)).await?)
    }

    /// All gates for a project, newest first.
    pub async fn history(&self, project_id: i64) -> WorkflowResult<Vec<ApprovalGate>> {
        Ok(self.db.call(move |db| db.gate_history(project_id)).await?)
    }

    /// Expire Pending gates older than `max_age` and pause their projects.
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> WorkflowResult<Vec<ApprovalGate>> {
        let cutoff = now - max_age;
        let notes = format!("Expired after {} hours without a decision", max_age.num_hours());
        let expired = self
            .db
            .call(move |db| {
                let mut expired = Vec::new();
                for gate in db.pending_gates_created_before(cutoff)? {
                    if let Some(gate) =
                        db.resolve_gate(gate.id, GateStatus::Expired, Some(&notes), now)?
                    {
                        db.update_project_status(gate.project_id, ProjectStatus::Paused)?;
                        expired.push(gate);
                    }
                }
                Ok(expired)
            })
            .await?;
        for gate in &expired {
            tracing::info!(
                project_id = gate.project_id,
                gate_id = gate.id,
                "Approval gate expired"
            );
        }
        Ok(expired)
    }
}
