use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    evaluation::{EvaluationRecord, FailureCategory},
    simulation::{RunStatus, SimulationResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryMean {
    pub category: FailureCategory,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureModeCount {
    pub mode: String,
    pub count: usize,
}

/// Counts, rates and means over one set of results. Used both for the whole
/// batch and for every per-scenario / per-personality subset.
///
/// Rates divide by `successful`, means over judged results only; a value is
/// `None` when its denominator is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub judged: usize,
    pub judge_failed: usize,
    pub goal_met: usize,
    pub gave_up: usize,
    pub turn_limit: usize,
    pub goal_met_rate: Option<f64>,
    pub gave_up_rate: Option<f64>,
    pub turn_limit_rate: Option<f64>,
    pub avg_turns: Option<f64>,
    pub avg_total_score: Option<f64>,
    /// One entry per category in ontology order; empty when nothing was judged.
    pub category_means: Vec<CategoryMean>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    #[serde(flatten)]
    pub overall: RunStats,
    /// Category means, worst (highest) first; ties keep ontology order.
    pub worst_categories: Vec<CategoryMean>,
    /// Primary failure modes by frequency; ties keep first-seen order.
    pub failure_modes: Vec<FailureModeCount>,
    pub by_scenario: BTreeMap<String, RunStats>,
    pub by_personality: BTreeMap<String, RunStats>,
}

/// Aggregates a batch. Pure and deterministic: results are taken in
/// `run_index` order regardless of how they were collected.
pub fn summarize(results: &[SimulationResult]) -> BatchReport {
    let mut ordered: Vec<&SimulationResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.run_index);

    let overall = RunStats::collect(&ordered);

    let mut worst_categories = overall.category_means.clone();
    worst_categories.sort_by(|a, b| {
        b.mean
            .total_cmp(&a.mean)
            .then_with(|| a.category.cmp(&b.category))
    });

    BatchReport {
        worst_categories,
        failure_modes: failure_modes(&ordered),
        by_scenario: breakdown(&ordered, |r| &r.scenario_id),
        by_personality: breakdown(&ordered, |r| &r.personality_id),
        overall,
    }
}

impl RunStats {
    fn collect(results: &[&SimulationResult]) -> Self {
        let total = results.len();
        let completed: Vec<&SimulationResult> =
            results.iter().copied().filter(|r| r.is_completed()).collect();
        let evaluations: Vec<&EvaluationRecord> =
            results.iter().filter_map(|r| r.evaluation.as_ref()).collect();

        let successful = completed.len();
        let goal_met = completed.iter().filter(|r| r.goal_met).count();
        let gave_up = completed.iter().filter(|r| r.gave_up).count();
        let turn_limit = completed.iter().filter(|r| r.timed_out).count();

        let category_means = if evaluations.is_empty() {
            Vec::new()
        } else {
            FailureCategory::ALL
                .iter()
                .map(|&category| CategoryMean {
                    category,
                    mean: evaluations.iter().map(|e| f64::from(e.score(category))).sum::<f64>()
                        / evaluations.len() as f64,
                })
                .collect()
        };

        Self {
            total,
            successful,
            failed: total - successful,
            judged: evaluations.len(),
            judge_failed: results
                .iter()
                .filter(|r| r.status == RunStatus::JudgeFailed)
                .count(),
            goal_met,
            gave_up,
            turn_limit,
            goal_met_rate: ratio(goal_met, successful),
            gave_up_rate: ratio(gave_up, successful),
            turn_limit_rate: ratio(turn_limit, successful),
            avg_turns: mean(completed.iter().map(|r| r.turn_count as f64)),
            avg_total_score: mean(evaluations.iter().map(|e| f64::from(e.total_score()))),
            category_means,
        }
    }
}

fn ratio(count: usize, of: usize) -> Option<f64> {
    (of > 0).then(|| count as f64 / of as f64)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn failure_modes(results: &[&SimulationResult]) -> Vec<FailureModeCount> {
    let mut counts: Vec<FailureModeCount> = Vec::new();
    for record in results.iter().filter_map(|r| r.evaluation.as_ref()) {
        let mode = record.primary_failure_mode.as_str();
        match counts.iter_mut().find(|c| c.mode == mode) {
            Some(entry) => entry.count += 1,
            None => counts.push(FailureModeCount {
                mode: mode.to_string(),
                count: 1,
            }),
        }
    }
    // Stable sort keeps first-seen order among equal counts.
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts
}

fn breakdown<'r>(
    results: &[&'r SimulationResult],
    key: impl Fn(&'r SimulationResult) -> &'r String,
) -> BTreeMap<String, RunStats> {
    let mut groups: BTreeMap<&'r String, Vec<&'r SimulationResult>> = BTreeMap::new();
    for &result in results {
        groups.entry(key(result)).or_default().push(result);
    }
    groups
        .into_iter()
        .map(|(id, subset)| (id.clone(), RunStats::collect(&subset)))
        .collect()
}
