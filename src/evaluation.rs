use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EvalError;

pub const MAX_SCORE: u8 = 5;

/// The fixed failure ontology. Declaration order is the canonical ordering used
/// for tie-breaking and rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TechnicalFailures,
    ComprehensionFailures,
    ResponseQualityFailures,
    KnowledgeFailures,
    TaskExecutionFailures,
    InteractionDesignFailures,
    SafetyComplianceFailures,
    EscalationBoundaryFailures,
    UserExperienceFailures,
    BusinessLogicFailures,
    MetaCognitiveFailures,
    TemporalFailures,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 12] = [
        FailureCategory::TechnicalFailures,
        FailureCategory::ComprehensionFailures,
        FailureCategory::ResponseQualityFailures,
        FailureCategory::KnowledgeFailures,
        FailureCategory::TaskExecutionFailures,
        FailureCategory::InteractionDesignFailures,
        FailureCategory::SafetyComplianceFailures,
        FailureCategory::EscalationBoundaryFailures,
        FailureCategory::UserExperienceFailures,
        FailureCategory::BusinessLogicFailures,
        FailureCategory::MetaCognitiveFailures,
        FailureCategory::TemporalFailures,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            FailureCategory::TechnicalFailures => "technical_failures",
            FailureCategory::ComprehensionFailures => "comprehension_failures",
            FailureCategory::ResponseQualityFailures => "response_quality_failures",
            FailureCategory::KnowledgeFailures => "knowledge_failures",
            FailureCategory::TaskExecutionFailures => "task_execution_failures",
            FailureCategory::InteractionDesignFailures => "interaction_design_failures",
            FailureCategory::SafetyComplianceFailures => "safety_compliance_failures",
            FailureCategory::EscalationBoundaryFailures => "escalation_boundary_failures",
            FailureCategory::UserExperienceFailures => "user_experience_failures",
            FailureCategory::BusinessLogicFailures => "business_logic_failures",
            FailureCategory::MetaCognitiveFailures => "meta_cognitive_failures",
            FailureCategory::TemporalFailures => "temporal_failures",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureCategory::TechnicalFailures => "Downtime, latency, API issues, data quality",
            FailureCategory::ComprehensionFailures => {
                "Intent misclassification, entity extraction, context loss"
            }
            FailureCategory::ResponseQualityFailures => {
                "Hallucinations, irrelevant responses, contradictions"
            }
            FailureCategory::KnowledgeFailures => {
                "Knowledge gaps, outdated info, retrieval failures"
            }
            FailureCategory::TaskExecutionFailures => {
                "Action failures, workflow errors, authorization issues"
            }
            FailureCategory::InteractionDesignFailures => {
                "Inappropriate tone, cultural insensitivity"
            }
            FailureCategory::SafetyComplianceFailures => {
                "Privacy breaches, security vulnerabilities"
            }
            FailureCategory::EscalationBoundaryFailures => {
                "Over-confidence, premature escalation"
            }
            FailureCategory::UserExperienceFailures => {
                "Frustration amplification, expectation mismatch"
            }
            FailureCategory::BusinessLogicFailures => {
                "Policy misapplication, exception handling errors"
            }
            FailureCategory::MetaCognitiveFailures => "Calibration errors, self-awareness gaps",
            FailureCategory::TemporalFailures => {
                "State management, timing errors, sequencing failures"
            }
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.key() == key)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    /// 0 = perfect, 5 = critical.
    pub score: u8,
    pub justification: String,
    pub confidence: f64,
}

/// A structurally valid judge verdict: every category scored, plus a summary and
/// the single most significant failure mode.
///
/// Deserializing goes through the same validation as judge payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct EvaluationRecord {
    #[serde(flatten)]
    pub scores: BTreeMap<FailureCategory, CategoryScore>,
    pub overall_summary: String,
    pub primary_failure_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl EvaluationRecord {
    /// Validates a raw judge payload. Nothing is defaulted: any missing or
    /// out-of-range field rejects the whole payload.
    pub fn from_payload(payload: &Value) -> Result<Self, EvalError> {
        let Value::Object(map) = payload else {
            return Err(malformed(vec![format!(
                "payload is not a JSON object (got {})",
                kind_of(payload)
            )]));
        };

        let mut problems = Vec::new();
        let mut scores = BTreeMap::new();

        for category in FailureCategory::ALL {
            match map.get(category.key()) {
                Some(entry) => match parse_category(entry) {
                    Ok(score) => {
                        scores.insert(category, score);
                    }
                    Err(reason) => problems.push(format!("{}: {reason}", category.key())),
                },
                None => problems.push(format!("missing category {}", category.key())),
            }
        }

        for key in map.keys() {
            if key.ends_with("_failures") && FailureCategory::from_key(key).is_none() {
                problems.push(format!("unexpected category {key}"));
            }
        }

        let overall_summary = required_string(map, "overall_summary", &mut problems);
        let primary_failure_mode = required_string(map, "primary_failure_mode", &mut problems);
        if primary_failure_mode.as_deref().is_some_and(|m| m.trim().is_empty()) {
            problems.push("primary_failure_mode is empty".to_string());
        }

        let suggestion = match map.get("suggestion") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                problems.push(format!("suggestion must be a string (got {})", kind_of(other)));
                None
            }
        };

        if !problems.is_empty() {
            return Err(malformed(problems));
        }

        Ok(Self {
            scores,
            overall_summary: overall_summary.unwrap_or_default(),
            primary_failure_mode: primary_failure_mode
                .map(|m| m.trim().to_string())
                .unwrap_or_default(),
            suggestion,
        })
    }

    pub fn score(&self, category: FailureCategory) -> u8 {
        self.scores.get(&category).map(|s| s.score).unwrap_or(0)
    }

    /// Sum of all category scores (0..=60).
    pub fn total_score(&self) -> u32 {
        self.scores.values().map(|s| u32::from(s.score)).sum()
    }
}

impl TryFrom<Value> for EvaluationRecord {
    type Error = EvalError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_payload(&value)
    }
}

fn parse_category(entry: &Value) -> Result<CategoryScore, String> {
    let Value::Object(fields) = entry else {
        return Err(format!("expected object, got {}", kind_of(entry)));
    };

    let score = match fields.get("score") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v <= u64::from(MAX_SCORE) => v as u8,
            Some(v) => return Err(format!("score {v} outside 0..={MAX_SCORE}")),
            None => return Err(format!("score {n} is not a non-negative integer")),
        },
        Some(other) => return Err(format!("score must be an integer (got {})", kind_of(other))),
        None => return Err("missing score".to_string()),
    };

    let justification = match fields.get("justification") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(format!(
                "justification must be a string (got {})",
                kind_of(other)
            ))
        }
        None => return Err("missing justification".to_string()),
    };

    let confidence = match fields.get("confidence").and_then(Value::as_f64) {
        Some(c) if (0.0..=1.0).contains(&c) => c,
        Some(c) => return Err(format!("confidence {c} outside [0, 1]")),
        None => return Err("missing or non-numeric confidence".to_string()),
    };

    Ok(CategoryScore {
        score,
        justification,
        confidence,
    })
}

fn required_string(map: &Map<String, Value>, key: &str, problems: &mut Vec<String>) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            problems.push(format!("{key} must be a string (got {})", kind_of(other)));
            None
        }
        None => {
            problems.push(format!("missing {key}"));
            None
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn malformed(problems: Vec<String>) -> EvalError {
    EvalError::MalformedJudgeOutput(problems.join("; "))
}
