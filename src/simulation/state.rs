use serde::{Deserialize, Serialize};

use crate::{participant::Signal, transcript::Speaker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Running,
    GoalMet,
    TurnLimit,
    GaveUp,
    Failed,
}

impl ConversationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConversationState::Running)
    }

    /// The single termination check, run after every appended turn.
    ///
    /// Precedence: a turn past the budget (only possible with `max_turns == 0`)
    /// ends the run on the limit and carries no signal; otherwise goal met, then
    /// give-up, then the turn limit. Signals only count when the user simulator
    /// raised them.
    pub fn after_turn(turn_count: usize, max_turns: usize, speaker: Speaker, signal: Signal) -> Self {
        if turn_count > max_turns {
            return ConversationState::TurnLimit;
        }

        if speaker == Speaker::User {
            match signal {
                Signal::GoalMet => return ConversationState::GoalMet,
                Signal::GaveUp => return ConversationState::GaveUp,
                Signal::None => {}
            }
        }

        if turn_count >= max_turns {
            ConversationState::TurnLimit
        } else {
            ConversationState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConversationState::{self, *};
    use crate::{participant::Signal, transcript::Speaker};

    #[test]
    fn keeps_running_under_budget() {
        assert_eq!(ConversationState::after_turn(1, 10, Speaker::User, Signal::None), Running);
        assert_eq!(ConversationState::after_turn(2, 10, Speaker::Support, Signal::None), Running);
        assert!(!Running.is_terminal());
    }

    #[test]
    fn user_signals_terminate() {
        assert_eq!(ConversationState::after_turn(5, 10, Speaker::User, Signal::GoalMet), GoalMet);
        assert_eq!(ConversationState::after_turn(5, 10, Speaker::User, Signal::GaveUp), GaveUp);
    }

    #[test]
    fn support_signals_are_ignored() {
        assert_eq!(ConversationState::after_turn(4, 10, Speaker::Support, Signal::GoalMet), Running);
    }

    #[test]
    fn give_up_beats_turn_limit_on_final_turn() {
        assert_eq!(ConversationState::after_turn(10, 10, Speaker::User, Signal::GaveUp), GaveUp);
        assert_eq!(ConversationState::after_turn(10, 10, Speaker::User, Signal::GoalMet), GoalMet);
        assert_eq!(ConversationState::after_turn(10, 10, Speaker::User, Signal::None), TurnLimit);
    }

    #[test]
    fn zero_budget_stops_after_opening() {
        assert_eq!(ConversationState::after_turn(1, 0, Speaker::User, Signal::None), TurnLimit);
        assert_eq!(ConversationState::after_turn(1, 0, Speaker::User, Signal::GoalMet), TurnLimit);
        assert!(TurnLimit.is_terminal());
    }
}
