use std::any::Any;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("prompt rendering failed: {0}")]
    Prompt(#[from] handlebars::RenderError),
}

/// Failures that can surface while running or judging a simulation.
///
/// Only the configuration variants are meant to reach a batch caller; everything
/// else is contained inside the run that produced it.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Provider(#[from] LLMError),

    #[error("malformed judge output: {0}")]
    MalformedJudgeOutput(String),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("unknown personality: {0}")]
    UnknownPersonality(String),

    #[error("unknown perturbation: {0}")]
    UnknownPerturbation(String),

    #[error("invalid catalog: {0}")]
    Catalog(String),

    #[error("invalid selection: {0}")]
    Selection(String),

    #[error("{what} call exceeded {after_ms}ms")]
    TimeoutExceeded { what: &'static str, after_ms: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("panicked: {0}")]
    Panicked(String),
}

impl EvalError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EvalError::UnknownScenario(_)
                | EvalError::UnknownPersonality(_)
                | EvalError::UnknownPerturbation(_)
                | EvalError::Catalog(_)
                | EvalError::Selection(_)
        )
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
