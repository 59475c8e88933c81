use std::fmt::Write;

use crate::report::summary::{BatchReport, RunStats};

const RULE_WIDTH: usize = 80;
const WORST_CATEGORY_LIMIT: usize = 5;
const FAILURE_MODE_LIMIT: usize = 10;

/// Plain-text report. Same report in, same bytes out.
pub fn render_text(report: &BatchReport) -> String {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);
    let overall = &report.overall;
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(out, "{heavy}");
    let _ = writeln!(out, "AI CUSTOMER SUPPORT EVALUATION REPORT");
    let _ = writeln!(out, "{heavy}");
    let _ = writeln!(out);

    let _ = writeln!(out, "SUMMARY");
    let _ = writeln!(out, "{light}");
    let _ = writeln!(out, "Total Simulations: {}", overall.total);
    let _ = writeln!(out, "Successful: {}", overall.successful);
    let _ = writeln!(out, "Failed: {}", overall.failed);
    let _ = writeln!(out, "Judge Failed: {}", overall.judge_failed);
    let _ = writeln!(out, "Goal Met Rate: {}", percent(overall.goal_met_rate));
    let _ = writeln!(out, "User Gave Up Rate: {}", percent(overall.gave_up_rate));
    let _ = writeln!(out, "Turn Limit Rate: {}", percent(overall.turn_limit_rate));
    let _ = writeln!(out, "Avg Conversation Turns: {}", decimal(overall.avg_turns));
    let _ = writeln!(out, "Avg Total Score: {}", decimal(overall.avg_total_score));
    let _ = writeln!(out);

    let _ = writeln!(out, "FAILURE ANALYSIS");
    let _ = writeln!(out, "{light}");
    let _ = writeln!(out, "Worst Performing Categories (0=perfect, 5=critical):");
    if report.worst_categories.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for entry in report.worst_categories.iter().take(WORST_CATEGORY_LIMIT) {
        let _ = writeln!(out, "  {}: {:.2}", entry.category, entry.mean);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Top Failure Modes:");
    if report.failure_modes.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for entry in report.failure_modes.iter().take(FAILURE_MODE_LIMIT) {
        let _ = writeln!(out, "  {}: {} occurrences", entry.mode, entry.count);
    }
    let _ = writeln!(out);

    breakdown_section(&mut out, "SCENARIO BREAKDOWN", &light, &report.by_scenario);
    breakdown_section(&mut out, "PERSONALITY BREAKDOWN", &light, &report.by_personality);

    let _ = writeln!(out, "{heavy}");
    out
}

fn breakdown_section<'a>(
    out: &mut String,
    title: &str,
    light: &str,
    rows: impl IntoIterator<Item = (&'a String, &'a RunStats)>,
) {
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{light}");

    let mut rows: Vec<(&String, &RunStats)> = rows.into_iter().collect();
    // Highest total score first, unjudged groups last, then by id.
    rows.sort_by(|(a_id, a), (b_id, b)| {
        let a_score = a.avg_total_score.unwrap_or(f64::NEG_INFINITY);
        let b_score = b.avg_total_score.unwrap_or(f64::NEG_INFINITY);
        b_score.total_cmp(&a_score).then_with(|| a_id.cmp(b_id))
    });

    for (id, stats) in rows {
        let _ = writeln!(out, "{id}:");
        let _ = writeln!(
            out,
            "  Count: {}, Goal Met: {}, Avg Score: {}, Avg Turns: {}",
            stats.total,
            percent(stats.goal_met_rate),
            decimal(stats.avg_total_score),
            decimal(stats.avg_turns),
        );
    }
    let _ = writeln!(out);
}

fn percent(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.2}%", rate * 100.0),
        None => "n/a".to_string(),
    }
}

fn decimal(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.2}"),
        None => "n/a".to_string(),
    }
}
