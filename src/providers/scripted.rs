use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Replays canned completions in order. Useful for dry runs and tests.
///
/// Entries are either a reply or a provider failure; once the queue is empty every
/// call fails.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for response in responses {
            provider.push(response);
        }
        provider
    }

    pub fn push(&self, response: impl Into<String>) {
        self.queue().push_back(Ok(response.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.queue().push_back(Err(message.into()));
    }

    pub fn remaining(&self) -> usize {
        self.queue().len()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        // A poisoned queue still holds valid entries.
        self.responses.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self.queue().pop_front() {
            Some(Ok(response)) => Ok(CompletionResponse {
                message: ChatMessage::assistant(response),
                usage: None,
            }),
            Some(Err(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
