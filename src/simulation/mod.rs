//! Single-conversation simulation: the turn-taking state machine, the
//! orchestrator that drives it, and the per-run result record.

pub mod orchestrator;
pub mod result;
pub mod state;

pub use orchestrator::{RunOptions, SimulationOrchestrator, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_TURNS};
pub use result::{RunStatus, SimulationResult, Termination};
pub use state::ConversationState;
