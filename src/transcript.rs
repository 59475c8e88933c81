use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Support,
    User,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Speaker::Support => Speaker::User,
            Speaker::User => Speaker::Support,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Speaker::Support => "AGENT",
            Speaker::User => "USER",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Support => f.write_str("support"),
            Speaker::User => f.write_str("user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub speaker: Speaker,
    pub text: String,
}

/// Append-only record of one simulated conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub scenario_id: String,
    pub personality_id: String,
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(scenario_id: impl Into<String>, personality_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            personality_id: personality_id.into(),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) -> &Turn {
        let index = self.turns.len();
        self.turns.push(Turn {
            index,
            speaker,
            text: text.into(),
        });
        &self.turns[index]
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn count_by(&self, speaker: Speaker) -> usize {
        self.turns.iter().filter(|t| t.speaker == speaker).count()
    }

    /// Chat history as seen by `perspective`: its own turns are `assistant`,
    /// the counterpart's are `user`.
    pub fn to_messages(&self, perspective: Speaker) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| {
                if turn.speaker == perspective {
                    ChatMessage::assistant(turn.text.clone())
                } else {
                    ChatMessage::user(turn.text.clone())
                }
            })
            .collect()
    }

    /// Plain `USER:` / `AGENT:` rendering used in judge prompts.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker.label(), turn.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
