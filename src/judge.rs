use std::{fmt, sync::Arc};

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::{json, Value};

use crate::{
    evaluation::{EvaluationRecord, FailureCategory},
    parsing::extract_json_object,
    transcript::Transcript,
    types::{ChatMessage, CompletionRequest},
    EvalError, LLMError, LLMProvider,
};

const JUDGE_SYSTEM_PROMPT: &str =
    "You are an expert evaluator assessing AI customer support agent performance.";

const JUDGE_TEMPLATE: &str = r#"Given the conversation transcript below, evaluate the support agent across the following 12 categories of failure.
For each category, assign:
- a score from 0-5 (0 = perfect, 5 = critical failure), as an integer
- a short justification (1-2 sentences)
- a confidence level between 0 and 1

Categories:
{{#each categories}}{{this.number}}. {{this.key}}: {{this.description}}
{{/each}}
Then provide:
- overall_summary: brief summary of the conversation quality
- primary_failure_mode: the single most significant failure (or "None")
- suggestion: one actionable improvement recommendation
{{#if goal}}
User's goal: {{goal}}
{{/if}}
Return ONLY valid JSON with exactly these keys:
{{{example}}}

[Transcript begins below]

{{transcript}}"#;

/// Scores a finished transcript. Returns the raw structured payload; validation
/// happens in [`judge_transcript`].
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, transcript: &Transcript, goal: Option<&str>) -> Result<Value, LLMError>;
}

/// Runs the judge and validates its payload into an [`EvaluationRecord`].
pub async fn judge_transcript(
    judge: &dyn Judge,
    transcript: &Transcript,
    goal: Option<&str>,
) -> Result<EvaluationRecord, EvalError> {
    let payload = judge.evaluate(transcript, goal).await?;
    EvaluationRecord::from_payload(&payload)
}

pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_tokens: u32,
}

impl fmt::Debug for LlmJudge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmJudge")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 4096,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate(&self, transcript: &Transcript, goal: Option<&str>) -> Result<Value, LLMError> {
        let prompt = render_judge_prompt(transcript, goal)?;
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(JUDGE_SYSTEM_PROMPT), ChatMessage::user(prompt)],
        )
        .with_max_tokens(self.max_tokens)
        .with_temperature(0.0)
        .with_json_object_format();

        let response = self.provider.complete(request).await?;
        let content = response.content();

        // Non-JSON replies are handed on verbatim so validation can reject them.
        Ok(extract_json_object(content, "primary_failure_mode")
            .unwrap_or_else(|| Value::String(content.to_string())))
    }
}

fn render_judge_prompt(transcript: &Transcript, goal: Option<&str>) -> Result<String, LLMError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);

    let categories: Vec<Value> = FailureCategory::ALL
        .iter()
        .enumerate()
        .map(|(i, c)| json!({"number": i + 1, "key": c.key(), "description": c.description()}))
        .collect();

    let data = json!({
        "categories": categories,
        "goal": goal,
        "example": example_payload(),
        "transcript": transcript.render(),
    });
    Ok(hb.render_template(JUDGE_TEMPLATE, &data)?)
}

fn example_payload() -> String {
    let mut lines = vec!["{".to_string()];
    for category in FailureCategory::ALL {
        lines.push(format!(
            "  \"{}\": {{\"score\": 0, \"justification\": \"...\", \"confidence\": 0.9}},",
            category.key()
        ));
    }
    lines.push("  \"overall_summary\": \"...\",".to_string());
    lines.push("  \"primary_failure_mode\": \"...\",".to_string());
    lines.push("  \"suggestion\": \"...\"".to_string());
    lines.push("}".to_string());
    lines.join("\n")
}
