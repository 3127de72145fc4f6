use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::agent::AgentId;

/// Routing verdict for one request. `target_agent_id` is `None` when nothing matched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelegationResult {
    pub target_agent_id: Option<AgentId>,
    pub reason: String,
    pub confidence: f32,
}

impl DelegationResult {
    pub fn to(agent_id: impl Into<AgentId>, reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            target_agent_id: Some(agent_id.into()),
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn unresolved(reason: impl Into<String>) -> Self {
        Self { target_agent_id: None, reason: reason.into(), confidence: 0.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub agent_id: AgentId,
    pub input: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<AgentId>, input: impl Into<String>) -> Self {
        Self { id: id.into(), agent_id: agent_id.into(), input: input.into(), depends_on: Vec::new() }
    }

    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed { error: String },
    Skipped { reason: String },
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Skipped { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub agent_id: AgentId,
    pub input: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn pending(step: &WorkflowStep) -> Self {
        Self {
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            input: step.input.clone(),
            status: StepStatus::Pending,
            output: None,
            duration_ms: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Completed,
    PartiallyFailed,
    Failed,
}

impl WorkflowStatus {
    /// COMPLETED only when every step succeeded; FAILED when none did.
    pub fn from_steps(steps: &[StepResult]) -> Self {
        let succeeded = steps.iter().filter(|step| step.status.is_success()).count();
        if steps.is_empty() || succeeded == 0 {
            Self::Failed
        } else if succeeded == steps.len() {
            Self::Completed
        } else {
            Self::PartiallyFailed
        }
    }
}

/// Lifecycle of one orchestrator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Routing,
    SingleAgent,
    MultiStep,
    Executing,
    Completed,
    PartiallyFailed,
    Failed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid run transition from {from:?} to {to:?}")]
pub struct RunTransitionError {
    pub from: RunState,
    pub to: RunState,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Routing)
                | (RunState::Routing, RunState::SingleAgent)
                | (RunState::Routing, RunState::MultiStep)
                | (RunState::Routing, RunState::Failed)
                | (RunState::SingleAgent, RunState::Executing)
                | (RunState::MultiStep, RunState::Executing)
                | (RunState::MultiStep, RunState::Failed)
                | (RunState::Executing, RunState::Completed)
                | (RunState::Executing, RunState::PartiallyFailed)
                | (RunState::Executing, RunState::Failed)
        )
    }

    pub fn transition(self, next: RunState) -> Result<RunState, RunTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RunTransitionError { from: self, to: next })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }
}

impl From<WorkflowStatus> for RunState {
    fn from(value: WorkflowStatus) -> Self {
        match value {
            WorkflowStatus::Completed => Self::Completed,
            WorkflowStatus::PartiallyFailed => Self::PartiallyFailed,
            WorkflowStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationResult>,
    pub steps: Vec<StepResult>,
    pub final_output: String,
    pub overall_status: WorkflowStatus,
}
