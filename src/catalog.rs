use std::{collections::HashSet, fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::EvalError;

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        };
        f.write_str(label)
    }
}

/// A customer situation the simulated user is grounded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub difficulty: Difficulty,
    /// Situational facts handed to the user simulator (order status and the like).
    pub context: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_info: Vec<String>,
}

/// Behavioural profile biasing how the simulated user writes and reacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    pub id: String,
    pub tone: String,
    pub technical_literacy: String,
    pub formality: String,
    pub trust_level: String,
}

/// Noise injected into the simulated user's phrasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perturbation {
    AddTypos,
    AddSlang,
    MixedLanguage,
    VeryShort,
    VeryLong,
    MissingDetails,
    Contradictory,
    IrrelevantInfo,
    AllCaps,
    NoPunctuation,
}

impl Perturbation {
    pub const ALL: [Perturbation; 10] = [
        Perturbation::AddTypos,
        Perturbation::AddSlang,
        Perturbation::MixedLanguage,
        Perturbation::VeryShort,
        Perturbation::VeryLong,
        Perturbation::MissingDetails,
        Perturbation::Contradictory,
        Perturbation::IrrelevantInfo,
        Perturbation::AllCaps,
        Perturbation::NoPunctuation,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Perturbation::AddTypos => "add_typos",
            Perturbation::AddSlang => "add_slang",
            Perturbation::MixedLanguage => "mixed_language",
            Perturbation::VeryShort => "very_short",
            Perturbation::VeryLong => "very_long",
            Perturbation::MissingDetails => "missing_details",
            Perturbation::Contradictory => "contradictory",
            Perturbation::IrrelevantInfo => "irrelevant_info",
            Perturbation::AllCaps => "all_caps",
            Perturbation::NoPunctuation => "no_punctuation",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Perturbation::AddTypos => "Include a few spelling mistakes.",
            Perturbation::AddSlang => "Use informal slang.",
            Perturbation::MixedLanguage => "Mix in words from another language.",
            Perturbation::VeryShort => "Keep every message extremely brief.",
            Perturbation::VeryLong => "Write overly detailed, rambling messages.",
            Perturbation::MissingDetails => "Leave out key details unless asked twice.",
            Perturbation::Contradictory => "Occasionally contradict something you said earlier.",
            Perturbation::IrrelevantInfo => "Include details that have nothing to do with the issue.",
            Perturbation::AllCaps => "WRITE EVERYTHING IN CAPITAL LETTERS.",
            Perturbation::NoPunctuation => "Do not use any punctuation marks.",
        }
    }
}

impl FromStr for Perturbation {
    type Err = EvalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        Perturbation::ALL
            .iter()
            .copied()
            .find(|p| p.key() == needle)
            .ok_or_else(|| EvalError::UnknownPerturbation(value.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    scenarios: Vec<Scenario>,
    personalities: Vec<Personality>,
}

/// Read-only scenario and personality tables, loaded once and shared by reference.
#[derive(Debug, Clone)]
pub struct Catalog {
    scenarios: Vec<Scenario>,
    personalities: Vec<Personality>,
}

impl Catalog {
    pub fn new(scenarios: Vec<Scenario>, personalities: Vec<Personality>) -> Result<Self, EvalError> {
        ensure_unique("scenario", scenarios.iter().map(|s| s.id.as_str()))?;
        ensure_unique("personality", personalities.iter().map(|p| p.id.as_str()))?;
        Ok(Self {
            scenarios,
            personalities,
        })
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_yaml_str(BUILTIN_CATALOG).expect("embedded catalog is valid")
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, EvalError> {
        let file: CatalogFile =
            serde_yaml::from_str(input).map_err(|e| EvalError::Catalog(e.to_string()))?;
        Self::new(file.scenarios, file.personalities)
    }

    pub fn from_json_str(input: &str) -> Result<Self, EvalError> {
        let file: CatalogFile =
            serde_json::from_str(input).map_err(|e| EvalError::Catalog(e.to_string()))?;
        Self::new(file.scenarios, file.personalities)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| EvalError::Catalog(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn personalities(&self) -> &[Personality] {
        &self.personalities
    }

    pub fn get_scenario(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    pub fn get_personality(&self, id: &str) -> Option<&Personality> {
        self.personalities.iter().find(|p| p.id == id)
    }

    pub fn scenario(&self, id: &str) -> Result<&Scenario, EvalError> {
        self.get_scenario(id)
            .ok_or_else(|| EvalError::UnknownScenario(id.to_string()))
    }

    pub fn personality(&self, id: &str) -> Result<&Personality, EvalError> {
        self.get_personality(id)
            .ok_or_else(|| EvalError::UnknownPersonality(id.to_string()))
    }
}

fn ensure_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), EvalError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(EvalError::Catalog(format!("duplicate {kind} id: {id}")));
        }
    }
    Ok(())
}
