use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{Perturbation, Personality, Scenario},
    judge::{judge_transcript, Judge},
    participant::{Participant, ParticipantReply, RoleConfig, SUPPORT_SYSTEM_PROMPT},
    simulation::{
        result::{RunStatus, SimulationResult, Termination},
        state::ConversationState,
    },
    error::panic_message,
    transcript::{Speaker, Transcript},
    EvalError,
};

pub const DEFAULT_MAX_TURNS: usize = 10;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-run knobs that are not part of the orchestrator itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_turns: usize,
    pub run_index: usize,
    pub perturbations: Vec<Perturbation>,
    pub cancel: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            run_index: 0,
            perturbations: Vec::new(),
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            ..Self::default()
        }
    }

    pub fn with_run_index(mut self, run_index: usize) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn with_perturbations(mut self, perturbations: impl IntoIterator<Item = Perturbation>) -> Self {
        self.perturbations = perturbations.into_iter().collect();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Drives one conversation between a support agent and a simulated user, then
/// has the judge score it.
///
/// The user speaks first and the sides strictly alternate. Every participant
/// and judge call is bounded by `call_timeout`, and a panic inside one is
/// recorded on the result like any other failed call.
#[derive(Clone)]
pub struct SimulationOrchestrator {
    support: Arc<dyn Participant>,
    user: Arc<dyn Participant>,
    judge: Arc<dyn Judge>,
    call_timeout: Duration,
}

impl fmt::Debug for SimulationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationOrchestrator")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl SimulationOrchestrator {
    pub fn new(
        support: Arc<dyn Participant>,
        user: Arc<dyn Participant>,
        judge: Arc<dyn Judge>,
    ) -> Self {
        Self {
            support,
            user,
            judge,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn run(
        &self,
        scenario: &Scenario,
        personality: &Personality,
        max_turns: usize,
    ) -> SimulationResult {
        self.run_with(scenario, personality, &RunOptions::new(max_turns))
            .await
    }

    /// Runs one conversation. Never returns an error: failures are recorded on
    /// the result together with whatever transcript was produced.
    #[tracing::instrument(
        name = "simulation",
        skip_all,
        fields(scenario = %scenario.id, personality = %personality.id, run = options.run_index)
    )]
    pub async fn run_with(
        &self,
        scenario: &Scenario,
        personality: &Personality,
        options: &RunOptions,
    ) -> SimulationResult {
        let started_at = Utc::now();
        let timer = Instant::now();
        let cancel = options.cancel.as_ref();

        let user_role = RoleConfig::User {
            scenario,
            personality,
            perturbations: &options.perturbations,
        };
        let support_role = RoleConfig::Support {
            system_prompt: SUPPORT_SYSTEM_PROMPT,
        };

        tracing::info!(max_turns = options.max_turns, "starting conversation");

        let mut transcript = Transcript::new(scenario.id.clone(), personality.id.clone());
        let mut speaker = Speaker::User;
        let mut state = ConversationState::Running;
        let mut failure: Option<EvalError> = None;

        while !state.is_terminal() {
            let (participant, role) = match speaker {
                Speaker::User => (self.user.as_ref(), &user_role),
                Speaker::Support => (self.support.as_ref(), &support_role),
            };

            let reply = self
                .bounded("participant", cancel, participant.respond(&transcript, role))
                .await;

            match reply {
                Ok(ParticipantReply { utterance, signal }) => {
                    let turn = transcript.push(speaker, utterance);
                    tracing::debug!(turn = turn.index, speaker = %speaker, %signal, "turn appended");
                    state = ConversationState::after_turn(
                        transcript.len(),
                        options.max_turns,
                        speaker,
                        signal,
                    );
                    speaker = speaker.other();
                }
                Err(err) => {
                    tracing::warn!(turn = transcript.len(), error = %err, "conversation failed");
                    failure = Some(err);
                    state = ConversationState::Failed;
                }
            }
        }

        let mut result = SimulationResult {
            run_index: options.run_index,
            scenario_id: scenario.id.clone(),
            personality_id: personality.id.clone(),
            status: RunStatus::Failed,
            termination: Termination::ParticipantError,
            goal_met: state == ConversationState::GoalMet,
            gave_up: state == ConversationState::GaveUp,
            timed_out: state == ConversationState::TurnLimit,
            turn_count: transcript.len(),
            transcript,
            evaluation: None,
            error: None,
            judge_error: None,
            perturbations: options.perturbations.clone(),
            started_at,
            duration_ms: 0,
        };

        match (Termination::from_state(state), failure) {
            (Some(termination), _) => {
                result.termination = termination;
                let judged = self
                    .bounded(
                        "judge",
                        cancel,
                        judge_transcript(self.judge.as_ref(), &result.transcript, Some(scenario.goal.as_str())),
                    )
                    .await;
                match judged {
                    Ok(record) => {
                        result.status = RunStatus::Success;
                        result.evaluation = Some(record);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "judge failed");
                        result.status = RunStatus::JudgeFailed;
                        result.judge_error = Some(err.to_string());
                    }
                }
            }
            (None, failure) => {
                let err = failure.unwrap_or(EvalError::Cancelled);
                result.termination = match err {
                    EvalError::TimeoutExceeded { .. } => Termination::Timeout,
                    EvalError::Cancelled => Termination::Cancelled,
                    EvalError::Panicked(_) => Termination::Panicked,
                    _ => Termination::ParticipantError,
                };
                result.error = Some(err.to_string());
            }
        }

        result.duration_ms = timer.elapsed().as_millis() as u64;
        tracing::info!(
            status = ?result.status,
            termination = ?result.termination,
            turns = result.turn_count,
            duration_ms = result.duration_ms,
            "conversation finished"
        );
        result
    }

    /// Applies the call timeout and, when present, the cancellation token to
    /// one outbound call. A panic in the call comes back as
    /// [`EvalError::Panicked`].
    async fn bounded<T, E, F>(
        &self,
        what: &'static str,
        cancel: Option<&CancellationToken>,
        fut: F,
    ) -> Result<T, EvalError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<EvalError>,
    {
        let timed = time::timeout(self.call_timeout, AssertUnwindSafe(fut).catch_unwind());
        let outcome = match cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(EvalError::Cancelled);
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(EvalError::Cancelled),
                    outcome = timed => outcome,
                }
            }
            None => timed.await,
        };

        match outcome {
            Ok(Ok(result)) => result.map_err(Into::into),
            Ok(Err(payload)) => Err(EvalError::Panicked(panic_message(payload.as_ref()))),
            Err(_) => Err(EvalError::TimeoutExceeded {
                what,
                after_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}
