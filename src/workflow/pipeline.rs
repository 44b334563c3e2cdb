//! The fixed development pipeline.
//!
//! Phases are numbered from 1 and looked up by number; a number past the end
//! of the pipeline means the workflow is finished.

use super::models::{AgentCommand, GateType, ProjectStatus};

/// Static description of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseConfig {
    pub number: u32,
    pub name: &'static str,
    pub description: &'static str,
    /// Agent command to run; `None` for pure review phases
    pub command: Option<AgentCommand>,
    pub requires_approval: bool,
    /// Gate opened when `requires_approval` is set
    pub gate_type: Option<GateType>,
    /// Project status entered when this phase starts
    pub project_status: ProjectStatus,
}

impl PhaseConfig {
    /// Gate to open for this phase, if it is approval-gated.
    pub fn gate(&self) -> Option<GateType> {
        if self.requires_approval {
            Some(self.gate_type.unwrap_or(GateType::PhaseStart))
        } else {
            None
        }
    }
}

pub const PIPELINE: &[PhaseConfig] = &[
    PhaseConfig {
        number: 1,
        name: "Vision Document Review",
        description: "Review and approve the generated vision document",
        command: None,
        requires_approval: true,
        gate_type: Some(GateType::VisionDoc),
        project_status: ProjectStatus::VisionReview,
    },
    PhaseConfig {
        number: 2,
        name: "Prime Context",
        description: "Load the complete project context into the agent runtime",
        command: Some(AgentCommand::Prime),
        requires_approval: false,
        gate_type: None,
        project_status: ProjectStatus::Planning,
    },
    PhaseConfig {
        number: 3,
        name: "Plan Feature",
        description: "Create detailed implementation plan",
        command: Some(AgentCommand::PlanFeatureGithub),
        requires_approval: true,
        gate_type: Some(GateType::PhaseStart),
        project_status: ProjectStatus::Planning,
    },
    PhaseConfig {
        number: 4,
        name: "Execute Implementation",
        description: "Implement the planned feature",
        command: Some(AgentCommand::ExecuteGithub),
        requires_approval: false,
        gate_type: None,
        project_status: ProjectStatus::InProgress,
    },
    PhaseConfig {
        number: 5,
        name: "Validate & Test",
        description: "Run tests and validate implementation",
        command: Some(AgentCommand::Validate),
        requires_approval: true,
        gate_type: Some(GateType::PhaseComplete),
        project_status: ProjectStatus::InProgress,
    },
];

/// An ordered, gap-free list of phase configs.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    phases: &'static [PhaseConfig],
}

impl Default for Pipeline {
    fn default() -> Self {
        Self { phases: PIPELINE }
    }
}

impl Pipeline {
    /// Use a custom phase list. Numbers must run 1, 2, 3, ... in order.
    pub fn new(phases: &'static [PhaseConfig]) -> Result<Self, String> {
        for (idx, phase) in phases.iter().enumerate() {
            let expected = idx as u32 + 1;
            if phase.number != expected {
                return Err(format!(
                    "Pipeline phase '{}' has number {}, expected {}",
                    phase.name, phase.number, expected
                ));
            }
        }
        Ok(Self { phases })
    }

    pub fn get(&self, number: u32) -> Option<&'static PhaseConfig> {
        let idx = usize::try_from(number.checked_sub(1)?).ok()?;
        self.phases.get(idx)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &'static [PhaseConfig] {
        self.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_is_numbered_from_one() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.len(), 5);
        assert!(Pipeline::new(PIPELINE).is_ok());
        for (idx, phase) in pipeline.phases().iter().enumerate() {
            assert_eq!(phase.number as usize, idx + 1);
        }
    }

    #[test]
    fn lookup_past_end_is_none() {
        let pipeline = Pipeline::default();
        assert!(pipeline.get(0).is_none());
        assert_eq!(pipeline.get(1).map(|p| p.name), Some("Vision Document Review"));
        assert!(pipeline.get(6).is_none());
    }

    #[test]
    fn approval_phases_have_gates() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.get(1).unwrap().gate(), Some(GateType::VisionDoc));
        assert_eq!(pipeline.get(2).unwrap().gate(), None);
        assert_eq!(pipeline.get(3).unwrap().gate(), Some(GateType::PhaseStart));
        assert_eq!(pipeline.get(5).unwrap().gate(), Some(GateType::PhaseComplete));
    }

    #[test]
    fn rejects_gapped_numbering() {
        static GAPPED: &[PhaseConfig] = &[PhaseConfig {
            number: 2,
            name: "Orphan",
            description: "",
            command: None,
            requires_approval: false,
            gate_type: None,
            project_status: ProjectStatus::Planning,
        }];
        let err = Pipeline::new(GAPPED).unwrap_err();
        assert!(err.contains("expected 1"));
    }
}
