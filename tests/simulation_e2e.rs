use std::sync::Arc;

use serde_json::{json, Map, Value};
use support_sim::{
    providers::scripted::ScriptedProvider, Catalog, FailureCategory, RunOptions, RunStatus,
    SimConfig, SimulationResult, Speaker, Termination,
};

fn judge_reply(score: u64, mode: &str) -> String {
    let mut payload = Map::new();
    for category in FailureCategory::ALL {
        payload.insert(
            category.key().to_string(),
            json!({"score": score, "justification": "Handled adequately.", "confidence": 0.9}),
        );
    }
    payload.insert("overall_summary".into(), json!("Agent resolved the delay."));
    payload.insert("primary_failure_mode".into(), json!(mode));
    payload.insert("suggestion".into(), json!("Offer a tracking link sooner."));
    Value::Object(payload).to_string()
}

fn user(message: &str, signal: &str) -> String {
    json!({"message": message, "signal": signal}).to_string()
}

#[tokio::test]
async fn order_delay_goal_met_end_to_end() {
    let catalog = Catalog::builtin();
    let scenario = catalog.scenario("order_delay").unwrap();
    let personality = catalog.personality("frustrated_impatient").unwrap();

    // One provider serves both sides and the judge, in call order.
    let provider = Arc::new(ScriptedProvider::from_responses([
        user("where is my order?? it was due 3 days ago", "none"),
        "Sorry about that! Can you share your order number?".to_string(),
        user("#12345. just tell me when it arrives", "none"),
        "It is with the carrier and arrives Friday. Here is the tracking link.".to_string(),
        "```json\n{\"message\": \"ok fine, thanks\", \"signal\": \"goal_met\"}\n```".to_string(),
        judge_reply(1, "Temporal - slow initial answer"),
    ]));
    let orchestrator = SimConfig::default().orchestrator_with(provider.clone());

    let result = orchestrator.run(scenario, personality, 10).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.termination, Termination::GoalMet);
    assert!(result.goal_met);
    assert!(!result.gave_up);
    assert_eq!(result.turn_count, 5);
    assert_eq!(result.transcript.count_by(Speaker::User), 3);
    assert_eq!(result.transcript.count_by(Speaker::Support), 2);
    assert_eq!(result.transcript.last().unwrap().text, "ok fine, thanks");

    let evaluation = result.evaluation.as_ref().expect("judged");
    assert_eq!(evaluation.scores.len(), 12);
    assert_eq!(evaluation.primary_failure_mode, "Temporal - slow initial answer");
    assert_eq!(provider.remaining(), 0);
}

#[tokio::test]
async fn provider_error_mid_conversation_keeps_transcript() {
    let catalog = Catalog::builtin();
    let provider = Arc::new(ScriptedProvider::from_responses([
        user("My account is locked.", "none"),
        "Let me look into that.".to_string(),
    ]));
    provider.push_failure("upstream 503");
    let orchestrator = SimConfig::default().orchestrator_with(provider);

    let result = orchestrator
        .run(
            catalog.scenario("account_locked").unwrap(),
            catalog.personality("calm_polite").unwrap(),
            10,
        )
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.termination, Termination::ParticipantError);
    assert_eq!(result.turn_count, 2);
    assert!(result.evaluation.is_none());
    assert!(result.error.as_deref().unwrap().contains("upstream 503"));
}

#[tokio::test]
async fn prose_user_reply_is_a_participant_failure() {
    let catalog = Catalog::builtin();
    let provider = Arc::new(ScriptedProvider::from_responses(["I just want my refund."]));
    let result = SimConfig::default()
        .orchestrator_with(provider)
        .run(
            catalog.scenario("refund_request").unwrap(),
            catalog.personality("calm_polite").unwrap(),
            10,
        )
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.turn_count, 0);
}

#[tokio::test]
async fn out_of_range_judge_score_is_never_kept() {
    let catalog = Catalog::builtin();
    let provider = Arc::new(ScriptedProvider::from_responses([
        user("I'm giving up, I'll call my bank.", "gave_up"),
        judge_reply(7, "Billing"),
    ]));
    let result = SimConfig::default()
        .orchestrator_with(provider)
        .run(
            catalog.scenario("billing_dispute").unwrap(),
            catalog.personality("angry_demanding").unwrap(),
            10,
        )
        .await;

    assert_eq!(result.status, RunStatus::JudgeFailed);
    assert!(result.gave_up);
    assert!(result.evaluation.is_none());
    assert!(result.judge_error.as_deref().unwrap().contains("malformed judge output"));
}

#[tokio::test]
async fn zero_turn_budget_never_reaches_support() {
    let catalog = Catalog::builtin();
    let provider = Arc::new(ScriptedProvider::from_responses([
        user("Hi, quick question about my order.", "goal_met"),
        judge_reply(0, "None"),
    ]));
    let result = SimConfig::default()
        .orchestrator_with(provider)
        .run_with(
            catalog.scenario("order_delay").unwrap(),
            catalog.personality("calm_polite").unwrap(),
            &RunOptions::new(0),
        )
        .await;

    assert_eq!(result.turn_count, 1);
    assert!(!result.goal_met);
    assert!(result.timed_out);
    assert_eq!(result.transcript.count_by(Speaker::Support), 0);
}

#[tokio::test]
async fn result_serializes_with_nested_records() {
    let catalog = Catalog::builtin();
    let provider = Arc::new(ScriptedProvider::from_responses([
        user("Where is my parcel?", "none"),
        "It arrives tomorrow.".to_string(),
        user("Great, thanks!", "goal_met"),
        judge_reply(0, "None"),
    ]));
    let result = SimConfig::default()
        .orchestrator_with(provider)
        .run(
            catalog.scenario("order_delay").unwrap(),
            catalog.personality("casual_friendly").unwrap(),
            10,
        )
        .await;

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["termination"], "goal_met");
    assert_eq!(value["transcript"]["turns"][0]["speaker"], "user");
    assert_eq!(value["evaluation"]["technical_failures"]["score"], 0);

    let back: SimulationResult = serde_json::from_value(value).unwrap();
    assert_eq!(back, result);
}
