use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use support_sim::{
    judge_transcript, providers::openai::{OpenAI, OpenAIConfig}, render_text, summarize,
    BatchReport, BatchRunner, Catalog, EvalError, LLMProvider, LlmJudge, PairSelection,
    RunOptions, SimConfig, SimulationResult, Transcript,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SimConfig::from_env();
    let catalog = config.load_catalog()?;
    let provider = match config.build_provider() {
        Ok(provider) => Some(provider),
        Err(e) => {
            tracing::warn!("no default provider ({e}); requests must carry a Bearer token");
            None
        }
    };

    let app_state = Arc::new(AppState {
        catalog,
        config,
        provider,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/scenarios", get(list_scenarios))
        .route("/personalities", get(list_personalities))
        .route("/simulate", post(simulate))
        .route("/batch_simulate", post(batch_simulate))
        .route("/evaluate", post(evaluate))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppState {
    catalog: Catalog,
    config: SimConfig,
    provider: Option<Arc<dyn LLMProvider>>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

fn eval_error_response(err: &EvalError) -> Response {
    let status = match err {
        EvalError::UnknownScenario(_) | EvalError::UnknownPersonality(_) => StatusCode::NOT_FOUND,
        EvalError::UnknownPerturbation(_) | EvalError::Catalog(_) | EvalError::Selection(_) => {
            StatusCode::BAD_REQUEST
        }
        EvalError::MalformedJudgeOutput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EvalError::TimeoutExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        EvalError::Provider(_) | EvalError::Cancelled => StatusCode::BAD_GATEWAY,
        EvalError::Panicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

#[derive(Serialize)]
struct Index {
    name: &'static str,
    version: &'static str,
    endpoints: [&'static str; 7],
}

async fn index() -> impl IntoResponse {
    ok(Index {
        name: "support-sim",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: [
            "GET /health",
            "GET /scenarios",
            "GET /personalities",
            "POST /simulate",
            "POST /batch_simulate",
            "POST /evaluate",
            "GET /",
        ],
    })
}

async fn health() -> impl IntoResponse {
    ok(serde_json::json!({ "status": "healthy" }))
}

async fn list_scenarios(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(state.catalog.scenarios())
}

async fn list_personalities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(state.catalog.personalities())
}

#[derive(Deserialize)]
struct SimulateRequest {
    scenario_id: String,
    personality_id: String,
    max_turns: Option<usize>,
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    perturbations: Vec<support_sim::Perturbation>,
}

async fn simulate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SimulateRequest>,
) -> Response {
    let scenario = match state.catalog.scenario(&req.scenario_id) {
        Ok(scenario) => scenario,
        Err(e) => return eval_error_response(&e),
    };
    let personality = match state.catalog.personality(&req.personality_id) {
        Ok(personality) => personality,
        Err(e) => return eval_error_response(&e),
    };
    let provider = match provider_for(&state, &headers) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    let orchestrator = state
        .config
        .orchestrator_with(provider)
        .with_call_timeout(call_timeout(&state, req.call_timeout_ms));
    let options = RunOptions::new(req.max_turns.unwrap_or(state.config.max_turns))
        .with_perturbations(req.perturbations);
    let result = orchestrator.run_with(scenario, personality, &options).await;
    ok(result)
}

#[derive(Deserialize)]
struct BatchRequest {
    num_simulations: usize,
    scenario_ids: Option<Vec<String>>,
    personality_ids: Option<Vec<String>>,
    seed: Option<u64>,
    max_turns: Option<usize>,
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    include_results: bool,
}

#[derive(Serialize)]
struct BatchResponse {
    report: BatchReport,
    rendered: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<SimulationResult>>,
    cancelled: bool,
}

async fn batch_simulate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> Response {
    let selection = PairSelection::UniformRandom {
        count: req.num_simulations,
        seed: req.seed.or(state.config.seed),
        scenario_ids: req.scenario_ids,
        personality_ids: req.personality_ids,
    };
    if let Err(e) = selection.resolve(&state.catalog) {
        return eval_error_response(&e);
    }
    let provider = match provider_for(&state, &headers) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    let runner = BatchRunner::new(&state.catalog, state.config.orchestrator_with(provider))
        .with_max_turns(req.max_turns.unwrap_or(state.config.max_turns))
        .with_call_timeout(call_timeout(&state, req.call_timeout_ms));
    let batch = match runner.run_batch(&selection).await {
        Ok(batch) => batch,
        Err(e) => return eval_error_response(&e),
    };

    let report = summarize(&batch.results);
    ok(BatchResponse {
        rendered: render_text(&report),
        report,
        results: req.include_results.then_some(batch.results),
        cancelled: batch.cancelled,
    })
}

#[derive(Deserialize)]
struct EvaluateRequest {
    transcript: Transcript,
    goal: Option<String>,
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EvaluateRequest>,
) -> Response {
    let provider = match provider_for(&state, &headers) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    let judge = LlmJudge::new(provider, state.config.judge_model.clone());

    let timeout = state.config.call_timeout;
    let judged = tokio::time::timeout(
        timeout,
        judge_transcript(&judge, &req.transcript, req.goal.as_deref()),
    )
    .await
    .unwrap_or_else(|_| {
        Err(EvalError::TimeoutExceeded {
            what: "judge",
            after_ms: timeout.as_millis() as u64,
        })
    });

    match judged {
        Ok(record) => ok(record),
        Err(e) => eval_error_response(&e),
    }
}

fn call_timeout(state: &AppState, requested_ms: Option<u64>) -> Duration {
    requested_ms
        .map(Duration::from_millis)
        .unwrap_or(state.config.call_timeout)
}

/// A `Bearer` token selects a per-request provider (`sk-or-` keys go to
/// OpenRouter); otherwise the provider configured at startup is used.
fn provider_for(state: &AppState, headers: &HeaderMap) -> Result<Arc<dyn LLMProvider>, Response> {
    let Some(auth_header) = headers.get("Authorization") else {
        return state.provider.clone().ok_or_else(|| {
            fail(
                StatusCode::UNAUTHORIZED,
                "No provider configured; send an Authorization: Bearer token",
            )
        });
    };

    let Some(token) = auth_header
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
    else {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            "Authorization header must be Bearer token",
        ));
    };

    let config = if token.starts_with("sk-or-") {
        OpenAIConfig::openrouter(token)
    } else {
        OpenAIConfig::new(token)
    };

    OpenAI::from_config(config)
        .map(|p| Arc::new(p) as Arc<dyn LLMProvider>)
        .map_err(|e| fail(StatusCode::BAD_REQUEST, format!("Failed to create provider: {}", e)))
}
