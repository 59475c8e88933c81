use std::{env, fmt, fs, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::Catalog,
    judge::LlmJudge,
    participant::LlmParticipant,
    providers::{openai::OpenAI, scripted::ScriptedProvider},
    simulation::{SimulationOrchestrator, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_TURNS},
    EvalError, LLMError, LLMProvider,
};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAI,
    OpenRouter,
    /// Replays canned replies from a JSON file; no network.
    Scripted,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => f.write_str("openai"),
            ProviderKind::OpenRouter => f.write_str("openrouter"),
            ProviderKind::Scripted => f.write_str("scripted"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "scripted" => Ok(ProviderKind::Scripted),
            other => Err(format!("unknown provider `{other}` (expected openai, openrouter or scripted)")),
        }
    }
}

/// Runtime settings for the binaries. Library types take these values through
/// their own builders; nothing in the library reads the environment by itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub max_turns: usize,
    pub call_timeout: Duration,
    pub support_model: String,
    pub user_model: String,
    pub judge_model: String,
    pub provider: ProviderKind,
    pub seed: Option<u64>,
    pub catalog_path: Option<PathBuf>,
    /// JSON array of reply strings for [`ProviderKind::Scripted`].
    pub script_path: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            support_model: DEFAULT_MODEL.to_string(),
            user_model: DEFAULT_MODEL.to_string(),
            judge_model: DEFAULT_MODEL.to_string(),
            provider: ProviderKind::default(),
            seed: None,
            catalog_path: None,
            script_path: None,
        }
    }
}

impl SimConfig {
    /// Reads `SUPPORT_SIM_*` variables. Unparsable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(turns) = lookup("SUPPORT_SIM_MAX_TURNS").and_then(|v| v.parse().ok()) {
            config.max_turns = turns;
        }
        if let Some(ms) = lookup("SUPPORT_SIM_CALL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(model) = lookup("SUPPORT_SIM_SUPPORT_MODEL") {
            config.support_model = model;
        }
        if let Some(model) = lookup("SUPPORT_SIM_USER_MODEL") {
            config.user_model = model;
        }
        if let Some(model) = lookup("SUPPORT_SIM_JUDGE_MODEL") {
            config.judge_model = model;
        }
        if let Some(provider) = lookup("SUPPORT_SIM_PROVIDER").and_then(|v| v.parse().ok()) {
            config.provider = provider;
        }
        if let Some(seed) = lookup("SUPPORT_SIM_SEED").and_then(|v| v.parse().ok()) {
            config.seed = Some(seed);
        }
        if let Some(path) = lookup("SUPPORT_SIM_CATALOG") {
            config.catalog_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("SUPPORT_SIM_SCRIPT") {
            config.script_path = Some(PathBuf::from(path));
        }

        config
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = Some(path.into());
        self
    }

    /// The configured catalog file, or the built-in one.
    pub fn load_catalog(&self) -> Result<Catalog, EvalError> {
        match &self.catalog_path {
            Some(path) => Catalog::from_path(path),
            None => Ok(Catalog::builtin()),
        }
    }

    pub fn build_provider(&self) -> Result<Arc<dyn LLMProvider>, LLMError> {
        match self.provider {
            ProviderKind::OpenAI => Ok(Arc::new(OpenAI::from_env()?)),
            ProviderKind::OpenRouter => Ok(Arc::new(OpenAI::openrouter_from_env()?)),
            ProviderKind::Scripted => {
                let replies: Vec<String> = match &self.script_path {
                    Some(path) => {
                        let content = fs::read_to_string(path).map_err(|e| {
                            LLMError::Provider(format!("{}: {e}", path.display()))
                        })?;
                        serde_json::from_str(&content)?
                    }
                    None => Vec::new(),
                };
                Ok(Arc::new(ScriptedProvider::from_responses(replies)))
            }
        }
    }

    /// Wires one provider into both participants and the judge.
    pub fn build_orchestrator(&self) -> Result<SimulationOrchestrator, LLMError> {
        let provider = self.build_provider()?;
        Ok(self.orchestrator_with(provider))
    }

    pub fn orchestrator_with(&self, provider: Arc<dyn LLMProvider>) -> SimulationOrchestrator {
        let support = LlmParticipant::new(provider.clone(), self.support_model.clone());
        let user = LlmParticipant::new(provider.clone(), self.user_model.clone());
        let judge = LlmJudge::new(provider, self.judge_model.clone());
        SimulationOrchestrator::new(Arc::new(support), Arc::new(user), Arc::new(judge))
            .with_call_timeout(self.call_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::{ProviderKind, SimConfig, DEFAULT_MODEL};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = SimConfig::from_lookup(|_| None);
        assert_eq!(config, SimConfig::default());
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert_eq!(config.judge_model, DEFAULT_MODEL);
        assert_eq!(config.provider, ProviderKind::OpenAI);
    }

    #[test]
    fn reads_overrides() {
        let config = SimConfig::from_lookup(lookup(&[
            ("SUPPORT_SIM_MAX_TURNS", "6"),
            ("SUPPORT_SIM_CALL_TIMEOUT_MS", "1500"),
            ("SUPPORT_SIM_JUDGE_MODEL", "judge-large"),
            ("SUPPORT_SIM_PROVIDER", "OpenRouter"),
            ("SUPPORT_SIM_SEED", "42"),
            ("SUPPORT_SIM_CATALOG", "data/catalog.yaml"),
        ]));
        assert_eq!(config.max_turns, 6);
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.judge_model, "judge-large");
        assert_eq!(config.support_model, DEFAULT_MODEL);
        assert_eq!(config.provider, ProviderKind::OpenRouter);
        assert_eq!(config.seed, Some(42));
        assert!(config.load_catalog().is_ok());
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let config = SimConfig::from_lookup(lookup(&[
            ("SUPPORT_SIM_MAX_TURNS", "many"),
            ("SUPPORT_SIM_PROVIDER", "carrier-pigeon"),
        ]));
        assert_eq!(config.max_turns, 10);
        assert_eq!(config.provider, ProviderKind::OpenAI);
    }

    #[test]
    fn missing_catalog_file_is_a_configuration_error() {
        let err = SimConfig::default()
            .with_catalog_path("does/not/exist.yaml")
            .load_catalog()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn scripted_provider_needs_no_credentials() {
        let config = SimConfig::default().with_provider(ProviderKind::Scripted);
        let provider = config.build_provider().expect("scripted provider");
        assert_eq!(provider.name(), "scripted");
    }
}
