use std::{fs, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use support_sim::{
    render_text, summarize, BatchRunner, Catalog, PairSelection, Perturbation, ProviderKind,
    RunOptions, SimConfig, SimulationResult,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "support-sim")]
#[command(about = "Simulate customers against a support agent and score the conversations")]
struct Cli {
    /// Scenario/personality catalog (YAML or JSON); built-in catalog when omitted
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// openai, openrouter or scripted (overrides SUPPORT_SIM_PROVIDER)
    #[arg(long, global = true)]
    provider: Option<ProviderKind>,

    /// Maximum utterances per conversation, both sides counted
    #[arg(long, global = true)]
    max_turns: Option<usize>,

    /// Wall-clock bound on each participant or judge call
    #[arg(long, global = true)]
    call_timeout_ms: Option<u64>,

    /// Seed for random pair sampling
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// JSON array of canned replies for the scripted provider
    #[arg(long, global = true)]
    script: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available scenarios
    ListScenarios,
    /// List available personalities
    ListPersonalities,
    /// Run one simulation and print the transcript and evaluation
    Single {
        #[arg(long)]
        scenario: String,
        #[arg(long)]
        personality: String,
        /// Style quirks for the simulated user, e.g. add_typos
        #[arg(long = "perturbation")]
        perturbations: Vec<String>,
        /// Write the result as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run randomly sampled simulations and print the report
    Batch {
        #[arg(long, default_value_t = 100)]
        num: usize,
        /// Restrict sampling to these scenarios
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Restrict sampling to these personalities
        #[arg(long = "personality")]
        personalities: Vec<String>,
        /// Write raw results as JSON
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write the text report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run one scenario against one or all personalities
    Targeted {
        #[arg(long)]
        scenario: String,
        #[arg(long, conflicts_with = "all_personalities")]
        personality: Option<String>,
        #[arg(long)]
        all_personalities: bool,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = SimConfig::from_env();
    if let Some(path) = cli.catalog {
        config = config.with_catalog_path(path);
    }
    if let Some(provider) = cli.provider {
        config = config.with_provider(provider);
    }
    if let Some(max_turns) = cli.max_turns {
        config = config.with_max_turns(max_turns);
    }
    if let Some(ms) = cli.call_timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }
    if let Some(path) = cli.script {
        config = config.with_script_path(path);
    }
    let catalog = config.load_catalog()?;

    match cli.command {
        Command::ListScenarios => list_scenarios(&catalog),
        Command::ListPersonalities => list_personalities(&catalog),
        Command::Single {
            scenario,
            personality,
            perturbations,
            output,
        } => {
            let scenario = catalog.scenario(&scenario)?;
            let personality = catalog.personality(&personality)?;
            let perturbations = perturbations
                .iter()
                .map(|p| p.parse::<Perturbation>())
                .collect::<Result<Vec<_>, _>>()?;
            let orchestrator = config.build_orchestrator()?;

            println!("\nRunning simulation: {} with {}", scenario.id, personality.id);
            println!("Goal: {}\n", scenario.goal);

            let options = RunOptions::new(config.max_turns).with_perturbations(perturbations);
            let result = orchestrator.run_with(scenario, personality, &options).await;
            print_single(&result);

            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                println!("\nResults saved to {}", path.display());
            }
        }
        Command::Batch {
            num,
            scenarios,
            personalities,
            output,
            report,
        } => {
            let selection = PairSelection::UniformRandom {
                count: num,
                seed: config.seed,
                scenario_ids: Some(scenarios),
                personality_ids: Some(personalities),
            };
            println!("\nRunning {num} simulations...\n");
            run_batch(&config, &catalog, &selection, output, report).await?;
        }
        Command::Targeted {
            scenario,
            personality,
            all_personalities,
            output,
            report,
        } => {
            let selection = if all_personalities {
                println!("\nRunning targeted test: {scenario} with ALL personalities\n");
                PairSelection::ScenarioAgainstAll {
                    scenario_id: scenario,
                }
            } else {
                PairSelection::Single {
                    scenario_id: scenario,
                    personality_id: personality,
                }
            };
            run_batch(&config, &catalog, &selection, output, report).await?;
        }
    }

    Ok(())
}

async fn run_batch(
    config: &SimConfig,
    catalog: &Catalog,
    selection: &PairSelection,
    output: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Unknown ids fail here, before any provider is built.
    selection.resolve(catalog)?;

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing with collected results");
            ctrl_c.cancel();
        }
    });

    let runner = BatchRunner::new(catalog, config.build_orchestrator()?)
        .with_max_turns(config.max_turns)
        .with_cancellation(token);
    let batch = runner.run_batch(selection).await?;
    if batch.cancelled {
        println!("\nBatch cancelled after {} runs.", batch.results.len());
    }

    println!("\nGenerating report...\n");
    let report = render_text(&summarize(&batch.results));
    println!("{report}");

    if let Some(path) = output {
        fs::write(&path, serde_json::to_string_pretty(&batch.results)?)?;
        println!("\nResults saved to {}", path.display());
    }
    if let Some(path) = report_path {
        fs::write(&path, &report)?;
        println!("Report saved to {}", path.display());
    }
    Ok(())
}

fn list_scenarios(catalog: &Catalog) {
    println!("\nAvailable Scenarios ({}):\n", catalog.scenarios().len());
    for scenario in catalog.scenarios() {
        println!("  {}: {} [{}]", scenario.id, scenario.kind, scenario.difficulty);
        println!("    Goal: {}", scenario.goal);
        println!();
    }
}

fn list_personalities(catalog: &Catalog) {
    println!("\nAvailable Personalities ({}):\n", catalog.personalities().len());
    for personality in catalog.personalities() {
        println!("  {}:", personality.id);
        println!(
            "    Tone: {}, Tech: {}",
            personality.tone, personality.technical_literacy
        );
        println!(
            "    Formality: {}, Trust: {}",
            personality.formality, personality.trust_level
        );
        println!();
    }
}

fn print_single(result: &SimulationResult) {
    let rule = "=".repeat(80);
    println!("\n{rule}\nCONVERSATION TRANSCRIPT\n{rule}\n");
    println!("{}\n", result.transcript.render());

    println!("{rule}\nEVALUATION RESULTS\n{rule}\n");
    match &result.evaluation {
        Some(evaluation) => {
            println!("Overall Summary: {}", evaluation.overall_summary);
            println!("Primary Failure Mode: {}", evaluation.primary_failure_mode);
            println!(
                "Suggestion: {}",
                evaluation.suggestion.as_deref().unwrap_or("N/A")
            );
            println!("Total Score: {}", evaluation.total_score());
        }
        None => {
            let reason = result
                .judge_error
                .as_deref()
                .or(result.error.as_deref())
                .unwrap_or("not evaluated");
            println!("No evaluation: {reason}");
        }
    }
    println!("\nStatus: {:?} ({:?})", result.status, result.termination);
    println!("Goal Met: {}", result.goal_met);
    println!("Turns: {}", result.turn_count);
}
