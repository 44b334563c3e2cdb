//! Typed error hierarchy for the Conductor orchestrator.
//!
//! `WorkflowError` carries the failure taxonomy shared by the phase state
//! machine, the approval gates and the command execution client. The public
//! workflow operations convert expected failures into an `Outcome`; only
//! infrastructure failures escape as `Err`.

use std::time::Duration;

use thiserror::Error;

/// Coarse failure class, persisted as a prefix of execution error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Connectivity,
    Timeout,
    Execution,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Agent runtime unreachable: {0}")]
    Connectivity(String),

    #[error("Command timed out after {:.1}s (timeout: {}s)", .elapsed.as_secs_f64(), .timeout.as_secs())]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Command execution cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::NotFound { .. } => FailureKind::Validation,
            Self::Connectivity(_) => FailureKind::Connectivity,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Execution(_) => FailureKind::Execution,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Database(_) => FailureKind::Internal,
        }
    }

    /// Error text as stored on execution and phase rows: `<kind>: <message>`.
    pub fn record_text(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(err)
    }
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_carries_elapsed_and_limit() {
        let err = WorkflowError::Timeout {
            elapsed: Duration::from_millis(6_000),
            timeout: Duration::from_secs(6),
        };
        assert_eq!(err.kind(), FailureKind::Timeout);
        let text = err.to_string();
        assert!(text.contains("6.0s"));
        assert!(text.contains("timeout: 6s"));
    }

    #[test]
    fn failure_kinds_are_distinct() {
        let conn = WorkflowError::Connectivity("refused".into());
        let exec = WorkflowError::Execution("boom".into());
        let timeout = WorkflowError::Timeout {
            elapsed: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        };
        assert_ne!(conn.kind(), exec.kind());
        assert_ne!(conn.kind(), timeout.kind());
        assert_ne!(exec.kind(), timeout.kind());
    }

    #[test]
    fn record_text_is_prefixed_with_kind() {
        let err = WorkflowError::Connectivity("connection refused".into());
        assert_eq!(
            err.record_text(),
            "connectivity: Agent runtime unreachable: connection refused"
        );
    }

    #[test]
    fn not_found_carries_entity_and_id() {
        let err = WorkflowError::NotFound {
            entity: "Approval gate",
            id: 42,
        };
        assert_eq!(err.to_string(), "Approval gate 42 not found");
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[test]
    fn anyhow_errors_become_database_errors() {
        let err: WorkflowError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, WorkflowError::Database(_)));
        assert_eq!(err.kind(), FailureKind::Internal);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkflowError::Database(anyhow::anyhow!("locked")));
        assert_std_error(&WorkflowError::Cancelled);
    }
}
