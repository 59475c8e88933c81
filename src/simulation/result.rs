use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::Perturbation,
    evaluation::EvaluationRecord,
    simulation::state::ConversationState,
    transcript::Transcript,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Conversation finished and was judged.
    Success,
    /// Conversation finished but the judge call failed or its payload was invalid.
    JudgeFailed,
    /// The conversation itself did not finish.
    Failed,
}

impl RunStatus {
    /// True when the conversation ran to a natural end, judged or not.
    pub fn is_completed(&self) -> bool {
        !matches!(self, RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    GoalMet,
    TurnLimit,
    GaveUp,
    ParticipantError,
    Timeout,
    Cancelled,
    Panicked,
}

impl Termination {
    pub(crate) fn from_state(state: ConversationState) -> Option<Self> {
        match state {
            ConversationState::GoalMet => Some(Termination::GoalMet),
            ConversationState::TurnLimit => Some(Termination::TurnLimit),
            ConversationState::GaveUp => Some(Termination::GaveUp),
            ConversationState::Running | ConversationState::Failed => None,
        }
    }
}

/// Everything produced by one simulated conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Position of the run within its batch; the identity key for reports.
    pub run_index: usize,
    pub scenario_id: String,
    pub personality_id: String,
    pub status: RunStatus,
    pub termination: Termination,
    pub goal_met: bool,
    pub gave_up: bool,
    /// Set when the run ended on the turn budget rather than a user signal.
    pub timed_out: bool,
    pub turn_count: usize,
    pub transcript: Transcript,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perturbations: Vec<Perturbation>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SimulationResult {
    /// A run that failed before or outside the conversation loop.
    pub fn failed(
        run_index: usize,
        scenario_id: impl Into<String>,
        personality_id: impl Into<String>,
        termination: Termination,
        error: impl Into<String>,
    ) -> Self {
        let scenario_id = scenario_id.into();
        let personality_id = personality_id.into();
        Self {
            run_index,
            transcript: Transcript::new(scenario_id.clone(), personality_id.clone()),
            scenario_id,
            personality_id,
            status: RunStatus::Failed,
            termination,
            goal_met: false,
            gave_up: false,
            timed_out: false,
            turn_count: 0,
            evaluation: None,
            error: Some(error.into()),
            judge_error: None,
            perturbations: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}
