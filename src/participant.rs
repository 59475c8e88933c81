use std::{fmt, sync::Arc};

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    catalog::{Perturbation, Personality, Scenario},
    parsing::extract_json_object,
    transcript::{Speaker, Transcript},
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

pub const SUPPORT_SYSTEM_PROMPT: &str = "You are a customer support agent for an e-commerce company.
Your job is to help customers with their issues including:
- Order delays and tracking
- Refunds and returns
- Wrong items received
- Account issues
- Billing disputes
- Subscription cancellations

Be helpful and friendly. Keep responses concise.";

const USER_SIMULATOR_TEMPLATE: &str = r#"You are simulating a customer in a support chat with an online store.

Your personality:
- Tone: {{personality.tone}}
- Technical literacy: {{personality.technical_literacy}}
- Formality: {{personality.formality}}
- Trust level: {{personality.trust_level}}

Your situation ({{scenario.type}}): {{scenario.context}}
Your goal: {{scenario.goal}}
{{#if perturbations}}
Style quirks:
{{#each perturbations}}- {{this}}
{{/each}}{{/if}}
Respond naturally as this person would. Keep messages short (1-3 sentences) like a real chat.

Reply ONLY with a JSON object of the form
{"message": "<what you type into the chat>", "signal": "none"}
Set "signal" to "goal_met" once your goal has been fully satisfied, to "gave_up" if you
are done trying with this agent (for example you will escalate elsewhere), otherwise "none"."#;

const OPENING_CUE: &str = "The support chat window just opened. Write your opening message.";

/// Terminal intent attached to a reply. Only the user simulator ever raises one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    #[default]
    None,
    #[serde(alias = "goal-met", alias = "done")]
    GoalMet,
    #[serde(alias = "giving_up", alias = "give_up", alias = "abandon")]
    GaveUp,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::None => f.write_str("none"),
            Signal::GoalMet => f.write_str("goal_met"),
            Signal::GaveUp => f.write_str("gave_up"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantReply {
    pub utterance: String,
    pub signal: Signal,
}

impl ParticipantReply {
    pub fn say(utterance: impl Into<String>) -> Self {
        Self {
            utterance: utterance.into(),
            signal: Signal::None,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }
}

/// Static, role-specific input for a participant call.
#[derive(Debug, Clone, Copy)]
pub enum RoleConfig<'a> {
    Support {
        system_prompt: &'a str,
    },
    User {
        scenario: &'a Scenario,
        personality: &'a Personality,
        perturbations: &'a [Perturbation],
    },
}

impl RoleConfig<'_> {
    pub fn speaker(&self) -> Speaker {
        match self {
            RoleConfig::Support { .. } => Speaker::Support,
            RoleConfig::User { .. } => Speaker::User,
        }
    }
}

/// One side of a simulated conversation.
///
/// Implementations see nothing but the transcript so far and their own role config.
#[async_trait]
pub trait Participant: Send + Sync {
    async fn respond(
        &self,
        transcript: &Transcript,
        role: &RoleConfig<'_>,
    ) -> Result<ParticipantReply, LLMError>;
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    #[serde(alias = "response", alias = "text", alias = "utterance")]
    message: String,
    #[serde(default)]
    signal: Signal,
}

/// Participant backed by a chat-completion provider. Plays either role depending
/// on the [`RoleConfig`] it is called with.
pub struct LlmParticipant {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl fmt::Debug for LlmParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmParticipant")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl LlmParticipant {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[async_trait]
impl Participant for LlmParticipant {
    async fn respond(
        &self,
        transcript: &Transcript,
        role: &RoleConfig<'_>,
    ) -> Result<ParticipantReply, LLMError> {
        let speaker = role.speaker();
        let system = match role {
            RoleConfig::Support { system_prompt } => system_prompt.to_string(),
            RoleConfig::User {
                scenario,
                personality,
                perturbations,
            } => render_user_prompt(scenario, personality, perturbations)?,
        };

        let mut messages = Vec::with_capacity(transcript.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(transcript.to_messages(speaker));
        if transcript.is_empty() {
            messages.push(ChatMessage::user(OPENING_CUE));
        }

        let mut request = self.request(messages);
        if speaker == Speaker::User {
            request = request.with_json_object_format();
        }

        let response = self.provider.complete(request).await?;
        let content = response.content();

        match speaker {
            Speaker::Support => Ok(ParticipantReply::say(content.trim())),
            Speaker::User => parse_user_reply(content),
        }
    }
}

fn render_user_prompt(
    scenario: &Scenario,
    personality: &Personality,
    perturbations: &[Perturbation],
) -> Result<String, LLMError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    let quirks: Vec<&str> = perturbations.iter().map(|p| p.instruction()).collect();
    let data = json!({
        "scenario": scenario,
        "personality": personality,
        "perturbations": quirks,
    });
    Ok(hb.render_template(USER_SIMULATOR_TEMPLATE, &data)?)
}

pub(crate) fn parse_user_reply(content: &str) -> Result<ParticipantReply, LLMError> {
    let value = extract_json_object(content, "message").ok_or_else(|| {
        LLMError::InvalidResponse("user simulator reply did not contain a JSON envelope".to_string())
    })?;
    let envelope: UserEnvelope = serde_json::from_value(value)
        .map_err(|e| LLMError::InvalidResponse(format!("user simulator envelope: {e}")))?;

    Ok(ParticipantReply::say(envelope.message.trim()).with_signal(envelope.signal))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::{
        catalog::{Catalog, Perturbation},
        providers::LLMProvider,
        transcript::{Speaker, Transcript},
        types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole},
        LLMError,
    };

    use super::{
        parse_user_reply, render_user_prompt, LlmParticipant, Participant, RoleConfig, Signal,
        SUPPORT_SYSTEM_PROMPT,
    };

    struct RecordingProvider {
        reply: String,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for RecordingProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            self.requests.lock().unwrap().push(request);
            Ok(CompletionResponse {
                message: ChatMessage::assistant(self.reply.clone()),
                usage: None,
            })
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn parses_signals_from_envelope() {
        let reply = parse_user_reply(r#"{"message": "Thanks, that fixed it!", "signal": "goal_met"}"#)
            .expect("valid envelope");
        assert_eq!(reply.utterance, "Thanks, that fixed it!");
        assert_eq!(reply.signal, Signal::GoalMet);

        let reply = parse_user_reply("```json\n{\"message\": \"Forget it.\", \"signal\": \"giving_up\"}\n```")
            .expect("fenced envelope");
        assert_eq!(reply.signal, Signal::GaveUp);

        let reply = parse_user_reply(r#"{"message": ""}"#).expect("missing signal defaults");
        assert_eq!(reply.signal, Signal::None);
        assert_eq!(reply.utterance, "");
    }

    #[test]
    fn prose_reply_is_malformed() {
        let err = parse_user_reply("Thanks GOAL_MET").unwrap_err();
        assert!(matches!(err, LLMError::InvalidResponse(_)));

        let err = parse_user_reply(r#"{"message": "hi", "signal": "maybe"}"#).unwrap_err();
        assert!(matches!(err, LLMError::InvalidResponse(_)));
    }

    #[test]
    fn user_prompt_carries_persona_goal_and_quirks() {
        let catalog = Catalog::builtin();
        let scenario = catalog.scenario("order_delay").unwrap();
        let personality = catalog.personality("frustrated_impatient").unwrap();

        let prompt = render_user_prompt(scenario, personality, &[Perturbation::AllCaps]).unwrap();
        assert!(prompt.contains("Tone: frustrated"));
        assert!(prompt.contains("Your goal: Get information about delayed order and resolution"));
        assert!(prompt.contains("(order_delay)"));
        assert!(prompt.contains("CAPITAL LETTERS"));

        let plain = render_user_prompt(scenario, personality, &[]).unwrap();
        assert!(!plain.contains("Style quirks"));

        let no_order = catalog.scenario("no_order_id").unwrap();
        let unescaped = render_user_prompt(no_order, personality, &[]).unwrap();
        assert!(unescaped.contains("can't find order confirmation email"));
    }

    #[tokio::test]
    async fn opening_call_cues_the_user_simulator() {
        let provider = Arc::new(RecordingProvider::new(r#"{"message": "Where is my order??", "signal": "none"}"#));
        let participant = LlmParticipant::new(provider.clone(), "sim-model");
        let catalog = Catalog::builtin();
        let role = RoleConfig::User {
            scenario: catalog.scenario("order_delay").unwrap(),
            personality: catalog.personality("calm_polite").unwrap(),
            perturbations: &[],
        };

        let reply = participant
            .respond(&Transcript::new("order_delay", "calm_polite"), &role)
            .await
            .expect("reply");
        assert_eq!(reply.utterance, "Where is my order??");

        let requests = provider.requests.lock().unwrap();
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].role, MessageRole::User);
        assert!(requests[0].response_format.is_some());
    }

    #[tokio::test]
    async fn support_side_never_signals() {
        let provider = Arc::new(RecordingProvider::new(
            r#"{"message": "ignored", "signal": "goal_met"}"#,
        ));
        let participant = LlmParticipant::new(provider.clone(), "support-model");
        let mut transcript = Transcript::new("s", "p");
        transcript.push(Speaker::User, "help");

        let reply = participant
            .respond(&transcript, &RoleConfig::Support { system_prompt: SUPPORT_SYSTEM_PROMPT })
            .await
            .expect("reply");
        assert_eq!(reply.signal, Signal::None);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[1].role, MessageRole::User);
        assert!(requests[0].response_format.is_none());
    }
}
