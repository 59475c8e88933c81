pub mod batch;
pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod judge;
pub mod participant;
pub mod providers;
pub mod report;
pub mod simulation;
pub mod transcript;
pub mod types;

mod parsing;

pub use batch::{BatchRun, BatchRunner, PairSelection, RunPair};
pub use catalog::{Catalog, Difficulty, Personality, Perturbation, Scenario};
pub use config::{ProviderKind, SimConfig};
pub use error::{EvalError, LLMError};
pub use evaluation::{CategoryScore, EvaluationRecord, FailureCategory};
pub use judge::{judge_transcript, Judge, LlmJudge};
pub use participant::{LlmParticipant, Participant, ParticipantReply, RoleConfig, Signal};
pub use providers::LLMProvider;
pub use report::{render_text, summarize, BatchReport};
pub use simulation::{
    ConversationState, RunOptions, RunStatus, SimulationOrchestrator, SimulationResult,
    Termination,
};
pub use transcript::{Speaker, Transcript, Turn};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
