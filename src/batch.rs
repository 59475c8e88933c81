use std::{panic::AssertUnwindSafe, time::Duration};

use futures_util::FutureExt;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{Catalog, Perturbation, Personality, Scenario},
    error::panic_message,
    simulation::{
        RunOptions, SimulationOrchestrator, SimulationResult, Termination, DEFAULT_MAX_TURNS,
    },
    EvalError,
};

/// Upper bound on `count` for [`PairSelection::UniformRandom`].
pub const MAX_SAMPLED_RUNS: usize = 100_000;

/// How the (scenario, personality) pairs of a batch are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PairSelection {
    /// Exactly these `(scenario_id, personality_id)` pairs, in order.
    Explicit { pairs: Vec<(String, String)> },
    /// `count` pairs drawn independently and uniformly, with replacement.
    /// Empty or absent id filters mean the whole catalog. `count` may not
    /// exceed [`MAX_SAMPLED_RUNS`].
    UniformRandom {
        count: usize,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default)]
        scenario_ids: Option<Vec<String>>,
        #[serde(default)]
        personality_ids: Option<Vec<String>>,
    },
    /// One scenario against every personality in catalog order.
    ScenarioAgainstAll { scenario_id: String },
    /// One scenario with one personality; the first catalog personality when unset.
    Single {
        scenario_id: String,
        #[serde(default)]
        personality_id: Option<String>,
    },
    /// Every scenario with every personality, scenario-major.
    CrossProduct,
}

impl PairSelection {
    pub fn uniform(count: usize, seed: Option<u64>) -> Self {
        PairSelection::UniformRandom {
            count,
            seed,
            scenario_ids: None,
            personality_ids: None,
        }
    }

    pub fn explicit<S, P>(pairs: impl IntoIterator<Item = (S, P)>) -> Self
    where
        S: Into<String>,
        P: Into<String>,
    {
        PairSelection::Explicit {
            pairs: pairs.into_iter().map(|(s, p)| (s.into(), p.into())).collect(),
        }
    }

    /// Resolves ids against the catalog. Any unknown id fails the whole
    /// selection before a single conversation starts.
    pub fn resolve<'c>(&self, catalog: &'c Catalog) -> Result<Vec<RunPair<'c>>, EvalError> {
        match self {
            PairSelection::Explicit { pairs } => pairs
                .iter()
                .map(|(s, p)| RunPair::lookup(catalog, s, p))
                .collect(),
            PairSelection::UniformRandom {
                count,
                seed,
                scenario_ids,
                personality_ids,
            } => {
                let scenarios = filter_scenarios(catalog, scenario_ids.as_deref())?;
                let personalities = filter_personalities(catalog, personality_ids.as_deref())?;
                if *count > MAX_SAMPLED_RUNS {
                    return Err(EvalError::Selection(format!(
                        "cannot sample {count} runs (limit {MAX_SAMPLED_RUNS})"
                    )));
                }
                if *count == 0 {
                    return Ok(Vec::new());
                }
                if scenarios.is_empty() || personalities.is_empty() {
                    return Err(EvalError::Catalog(
                        "cannot sample from an empty scenario or personality set".to_string(),
                    ));
                }

                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_entropy(),
                };
                // Both sets are non-empty, so choose always yields.
                Ok((0..*count)
                    .filter_map(|_| {
                        let scenario = *scenarios.choose(&mut rng)?;
                        let personality = *personalities.choose(&mut rng)?;
                        Some(RunPair {
                            scenario,
                            personality,
                        })
                    })
                    .collect())
            }
            PairSelection::ScenarioAgainstAll { scenario_id } => {
                let scenario = catalog.scenario(scenario_id)?;
                Ok(catalog
                    .personalities()
                    .iter()
                    .map(|personality| RunPair {
                        scenario,
                        personality,
                    })
                    .collect())
            }
            PairSelection::Single {
                scenario_id,
                personality_id,
            } => {
                let scenario = catalog.scenario(scenario_id)?;
                let personality = match personality_id {
                    Some(id) => catalog.personality(id)?,
                    None => catalog.personalities().first().ok_or_else(|| {
                        EvalError::Catalog("catalog has no personalities".to_string())
                    })?,
                };
                Ok(vec![RunPair {
                    scenario,
                    personality,
                }])
            }
            PairSelection::CrossProduct => Ok(catalog
                .scenarios()
                .iter()
                .flat_map(|scenario| {
                    catalog.personalities().iter().map(move |personality| RunPair {
                        scenario,
                        personality,
                    })
                })
                .collect()),
        }
    }
}

fn filter_scenarios<'c>(
    catalog: &'c Catalog,
    ids: Option<&[String]>,
) -> Result<Vec<&'c Scenario>, EvalError> {
    match ids {
        Some(ids) if !ids.is_empty() => ids.iter().map(|id| catalog.scenario(id)).collect(),
        _ => Ok(catalog.scenarios().iter().collect()),
    }
}

fn filter_personalities<'c>(
    catalog: &'c Catalog,
    ids: Option<&[String]>,
) -> Result<Vec<&'c Personality>, EvalError> {
    match ids {
        Some(ids) if !ids.is_empty() => ids.iter().map(|id| catalog.personality(id)).collect(),
        _ => Ok(catalog.personalities().iter().collect()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunPair<'c> {
    pub scenario: &'c Scenario,
    pub personality: &'c Personality,
}

impl<'c> RunPair<'c> {
    pub fn lookup(
        catalog: &'c Catalog,
        scenario_id: &str,
        personality_id: &str,
    ) -> Result<Self, EvalError> {
        Ok(Self {
            scenario: catalog.scenario(scenario_id)?,
            personality: catalog.personality(personality_id)?,
        })
    }
}

/// Results of a batch, in invocation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRun {
    pub results: Vec<SimulationResult>,
    /// True when the batch stopped early on cancellation.
    pub cancelled: bool,
}

/// Runs pairs through the orchestrator one after another.
///
/// A run that fails, times out or panics becomes a failed [`SimulationResult`]
/// and the batch moves on; only selection errors are returned to the caller.
pub struct BatchRunner<'c> {
    catalog: &'c Catalog,
    orchestrator: SimulationOrchestrator,
    max_turns: usize,
    perturbations: Vec<Perturbation>,
    cancel: Option<CancellationToken>,
}

impl<'c> BatchRunner<'c> {
    pub fn new(catalog: &'c Catalog, orchestrator: SimulationOrchestrator) -> Self {
        Self {
            catalog,
            orchestrator,
            max_turns: DEFAULT_MAX_TURNS,
            perturbations: Vec::new(),
            cancel: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_perturbations(mut self, perturbations: impl IntoIterator<Item = Perturbation>) -> Self {
        self.perturbations = perturbations.into_iter().collect();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bounds every participant and judge call of the batch's runs.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_call_timeout(timeout);
        self
    }

    pub async fn run_batch(&self, selection: &PairSelection) -> Result<BatchRun, EvalError> {
        let pairs = selection.resolve(self.catalog)?;
        Ok(self.run_pairs(&pairs).await)
    }

    pub async fn run_pairs(&self, pairs: &[RunPair<'_>]) -> BatchRun {
        let mut batch = BatchRun {
            results: Vec::with_capacity(pairs.len()),
            cancelled: false,
        };

        for (run_index, pair) in pairs.iter().enumerate() {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                tracing::info!(completed = run_index, total = pairs.len(), "batch cancelled");
                batch.cancelled = true;
                break;
            }

            tracing::info!(
                run = run_index,
                total = pairs.len(),
                scenario = %pair.scenario.id,
                personality = %pair.personality.id,
                "running simulation"
            );

            let result = self.run_contained(run_index, pair).await;
            let interrupted = result.termination == Termination::Cancelled;
            batch.results.push(result);
            if interrupted {
                batch.cancelled = true;
                break;
            }
        }

        batch
    }

    async fn run_contained(&self, run_index: usize, pair: &RunPair<'_>) -> SimulationResult {
        let mut options = RunOptions::new(self.max_turns)
            .with_run_index(run_index)
            .with_perturbations(self.perturbations.iter().copied());
        options.cancel = self.cancel.clone();

        let run = self
            .orchestrator
            .run_with(pair.scenario, pair.personality, &options);

        // The orchestrator contains panics of the calls it makes; this catches
        // anything that escapes it.
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(run = run_index, error = %message, "simulation panicked");
                let mut result = SimulationResult::failed(
                    run_index,
                    pair.scenario.id.clone(),
                    pair.personality.id.clone(),
                    Termination::Panicked,
                    format!("panic: {message}"),
                );
                result.perturbations = self.perturbations.clone();
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use crate::{
        catalog::Catalog,
        evaluation::tests::payload_with,
        judge::Judge,
        participant::{Participant, ParticipantReply, RoleConfig, Signal},
        simulation::{RunStatus, SimulationOrchestrator, Termination},
        transcript::Transcript,
        EvalError, LLMError,
    };

    use super::{BatchRunner, PairSelection, RunPair, MAX_SAMPLED_RUNS};

    /// User side: ends every conversation on its second utterance, panics for
    /// one scenario, and can cancel a token after a number of calls.
    struct User {
        calls: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl User {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                cancel_after: None,
            })
        }
    }

    #[async_trait]
    impl Participant for User {
        async fn respond(
            &self,
            transcript: &Transcript,
            role: &RoleConfig<'_>,
        ) -> Result<ParticipantReply, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if n >= *limit {
                    token.cancel();
                }
            }
            if let RoleConfig::User { scenario, .. } = role {
                if scenario.id == "wrong_item" {
                    panic!("simulator exploded");
                }
                if scenario.id == "account_locked" {
                    return Err(LLMError::Provider("rate limited".into()));
                }
            }
            if transcript.is_empty() {
                Ok(ParticipantReply::say("hello"))
            } else {
                Ok(ParticipantReply::say("thanks").with_signal(Signal::GoalMet))
            }
        }
    }

    struct Support;

    #[async_trait]
    impl Participant for Support {
        async fn respond(&self, _: &Transcript, _: &RoleConfig<'_>) -> Result<ParticipantReply, LLMError> {
            Ok(ParticipantReply::say("sorted"))
        }
    }

    struct OkJudge;

    #[async_trait]
    impl Judge for OkJudge {
        async fn evaluate(&self, _: &Transcript, _: Option<&str>) -> Result<Value, LLMError> {
            Ok(payload_with(1, "None"))
        }
    }

    struct SilentSupport;

    #[async_trait]
    impl Participant for SilentSupport {
        async fn respond(&self, _: &Transcript, _: &RoleConfig<'_>) -> Result<ParticipantReply, LLMError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct PanickingJudge;

    #[async_trait]
    impl Judge for PanickingJudge {
        async fn evaluate(&self, _: &Transcript, _: Option<&str>) -> Result<Value, LLMError> {
            panic!("rubric missing")
        }
    }

    fn orchestrator(user: Arc<User>) -> SimulationOrchestrator {
        SimulationOrchestrator::new(Arc::new(Support), user, Arc::new(OkJudge))
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let catalog = Catalog::builtin();
        let selection = PairSelection::uniform(8, Some(42));
        fn ids(pairs: Vec<RunPair<'_>>) -> Vec<(String, String)> {
            pairs
                .iter()
                .map(|p| (p.scenario.id.clone(), p.personality.id.clone()))
                .collect()
        }
        let first = ids(selection.resolve(&catalog).unwrap());
        let second = ids(selection.resolve(&catalog).unwrap());
        assert_eq!(first.len(), 8);
        assert_eq!(first, second);
    }

    #[test]
    fn filtered_sampling_stays_in_subset() {
        let catalog = Catalog::builtin();
        let selection = PairSelection::UniformRandom {
            count: 20,
            seed: Some(7),
            scenario_ids: Some(vec!["order_delay".into(), "refund_request".into()]),
            personality_ids: Some(vec!["calm_polite".into()]),
        };
        for pair in selection.resolve(&catalog).unwrap() {
            assert!(["order_delay", "refund_request"].contains(&pair.scenario.id.as_str()));
            assert_eq!(pair.personality.id, "calm_polite");
        }
    }

    #[test]
    fn enumerating_policies() {
        let catalog = Catalog::builtin();

        let targeted = PairSelection::ScenarioAgainstAll {
            scenario_id: "order_delay".into(),
        }
        .resolve(&catalog)
        .unwrap();
        assert_eq!(targeted.len(), catalog.personalities().len());
        assert!(targeted.iter().all(|p| p.scenario.id == "order_delay"));

        let single = PairSelection::Single {
            scenario_id: "order_delay".into(),
            personality_id: None,
        }
        .resolve(&catalog)
        .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].personality.id, catalog.personalities()[0].id);

        let all = PairSelection::CrossProduct.resolve(&catalog).unwrap();
        assert_eq!(all.len(), catalog.scenarios().len() * catalog.personalities().len());
    }

    #[test]
    fn unknown_ids_fail_fast() {
        let catalog = Catalog::builtin();
        let err = PairSelection::explicit([("order_delay", "calm_polite"), ("nope", "calm_polite")])
            .resolve(&catalog)
            .unwrap_err();
        assert!(matches!(err, EvalError::UnknownScenario(ref id) if id == "nope"));
        assert!(err.is_configuration());

        let err = PairSelection::UniformRandom {
            count: 3,
            seed: None,
            scenario_ids: None,
            personality_ids: Some(vec!["ghost".into()]),
        }
        .resolve(&catalog)
        .unwrap_err();
        assert!(matches!(err, EvalError::UnknownPersonality(_)));
    }

    #[test]
    fn oversized_sample_is_a_configuration_error() {
        let catalog = Catalog::builtin();
        let err = PairSelection::uniform(usize::MAX / 8, Some(1))
            .resolve(&catalog)
            .unwrap_err();
        assert!(matches!(err, EvalError::Selection(_)));
        assert!(err.is_configuration());

        let err = PairSelection::uniform(MAX_SAMPLED_RUNS + 1, None)
            .resolve(&catalog)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn configuration_error_runs_nothing() {
        let catalog = Catalog::builtin();
        let user = User::new();
        let runner = BatchRunner::new(&catalog, orchestrator(user.clone()));
        let err = runner
            .run_batch(&PairSelection::explicit([("order_delay", "ghost")]))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(user.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained_in_order() {
        let catalog = Catalog::builtin();
        let runner = BatchRunner::new(&catalog, orchestrator(User::new()));
        let batch = runner
            .run_batch(&PairSelection::explicit([
                ("order_delay", "calm_polite"),
                ("wrong_item", "calm_polite"),
                ("account_locked", "angry_demanding"),
                ("refund_request", "calm_polite"),
            ]))
            .await
            .unwrap();

        assert!(!batch.cancelled);
        let indices: Vec<usize> = batch.results.iter().map(|r| r.run_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert_eq!(batch.results[0].status, RunStatus::Success);
        assert_eq!(batch.results[1].termination, Termination::Panicked);
        assert!(batch.results[1].error.as_deref().unwrap().contains("simulator exploded"));
        assert_eq!(batch.results[2].termination, Termination::ParticipantError);
        assert_eq!(batch.results[2].scenario_id, "account_locked");
        assert_eq!(batch.results[3].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn cancellation_keeps_collected_results() {
        let catalog = Catalog::builtin();
        let token = CancellationToken::new();
        // Each completed run makes two user calls; the third call opens run 1
        // and cancels, so the support reply that follows is never requested.
        let user = Arc::new(User {
            calls: AtomicUsize::new(0),
            cancel_after: Some((3, token.clone())),
        });
        let runner = BatchRunner::new(&catalog, orchestrator(user)).with_cancellation(token);
        let batch = runner
            .run_batch(&PairSelection::ScenarioAgainstAll {
                scenario_id: "order_delay".into(),
            })
            .await
            .unwrap();

        assert!(batch.cancelled);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0].status, RunStatus::Success);
        assert_eq!(batch.results[1].termination, Termination::Cancelled);
        assert_eq!(batch.results[1].turn_count, 1);
    }

    #[tokio::test]
    async fn judge_panic_keeps_the_conversation() {
        let catalog = Catalog::builtin();
        let orchestrator =
            SimulationOrchestrator::new(Arc::new(Support), User::new(), Arc::new(PanickingJudge));
        let batch = BatchRunner::new(&catalog, orchestrator)
            .run_batch(&PairSelection::explicit([("order_delay", "calm_polite")]))
            .await
            .unwrap();

        let result = &batch.results[0];
        assert_eq!(result.status, RunStatus::JudgeFailed);
        assert_eq!(result.termination, Termination::GoalMet);
        assert!(result.goal_met);
        assert_eq!(result.turn_count, 3);
        assert_eq!(result.transcript.len(), 3);
        assert!(result.judge_error.as_deref().unwrap().contains("rubric missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_call_timeout_bounds_each_run() {
        let catalog = Catalog::builtin();
        let orchestrator =
            SimulationOrchestrator::new(Arc::new(SilentSupport), User::new(), Arc::new(OkJudge));
        let batch = BatchRunner::new(&catalog, orchestrator)
            .with_call_timeout(Duration::from_millis(100))
            .run_batch(&PairSelection::explicit([
                ("order_delay", "calm_polite"),
                ("refund_request", "calm_polite"),
            ]))
            .await
            .unwrap();

        assert_eq!(batch.results.len(), 2);
        for result in &batch.results {
            assert_eq!(result.termination, Termination::Timeout);
            assert_eq!(result.turn_count, 1);
            assert!(result.error.as_deref().unwrap().contains("participant call exceeded 100ms"));
        }
    }
}
