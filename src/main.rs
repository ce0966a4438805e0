use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_inference_gateway::config::{self, ConfigFile, ConfigHandle, ConfigSnapshot};
use tiered_inference_gateway::error::AppError;
use tiered_inference_gateway::health::HealthStore;
use tiered_inference_gateway::metrics;
use tiered_inference_gateway::orchestrator::{FailoverOrchestrator, RouteError};
use tiered_inference_gateway::protocol::openai::{ChatCompletionRequest, ChatCompletionResponse};
use tiered_inference_gateway::tier::TierClassifier;
use tiered_inference_gateway::trace::TraceBus;
use tiered_inference_gateway::upstream::UpstreamCaller;

#[derive(Parser)]
#[command(name = "tiered-inference-gateway")]
#[command(about = "Tier-aware routing and failover gateway for LLM inference providers", long_about = None)]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "~/.tiered-gateway/config.json")]
    config: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Connection pool size per host for the shared upstream HTTP client
    #[arg(long, env = "GATEWAY_POOL_SIZE", default_value = "32")]
    pool_size: usize,
}

#[derive(Clone)]
struct AppState {
    config: ConfigHandle,
    orchestrator: Arc<FailoverOrchestrator>,
    health: Arc<HealthStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiered_inference_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    if let Some(parent) = PathBuf::from(&config_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let snapshot = load_or_init_config(&config_path)?;
    tracing::info!(path = %config_path, "loaded config");
    let config = ConfigHandle::new(snapshot.clone());

    let health_path = PathBuf::from(&config_path)
        .parent()
        .map(|p| p.join("model_stats.json"))
        .unwrap_or_else(|| PathBuf::from("model_stats.json"));
    let health = Arc::new(HealthStore::new(
        snapshot.health().decay_rate,
        Some(health_path),
    ));
    health.reconcile(&snapshot.models().all_models());

    let bus = Arc::new(TraceBus::new());
    let client = config::build_http_client(cli.pool_size)?;
    let insecure_client = config::build_insecure_http_client(cli.pool_size)?;

    let classifier = TierClassifier::new(client.clone(), insecure_client.clone());
    let caller = UpstreamCaller::new(client, insecure_client);
    let orchestrator = Arc::new(FailoverOrchestrator::new(
        classifier,
        caller,
        health.clone(),
        bus,
    ));

    let state = AppState {
        config,
        orchestrator,
        health,
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/health-store", get(health_store))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Loads `config.json`, falling back to an in-memory default document (never
/// written to disk) when the file doesn't exist yet, so a first run against a
/// fresh directory doesn't require hand-authoring a config up front.
fn load_or_init_config(path: &str) -> Result<ConfigSnapshot> {
    if PathBuf::from(path).exists() {
        ConfigSnapshot::from_file(path).with_context(|| format!("failed to load config from {path}"))
    } else {
        tracing::warn!(path, "config file not found, starting with defaults");
        ConfigSnapshot::new(ConfigFile::default())
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, AppError> {
    let config = state.config.get();
    match state.orchestrator.handle(&request, &config).await {
        Ok(response) => Ok(Json(response)),
        Err(RouteError::Configuration(e)) => Err(AppError(anyhow::anyhow!(e.to_string()))),
        Err(RouteError::Exhausted(e)) => Err(AppError(anyhow::anyhow!(e.to_string()))),
    }
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.config.get();
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut models: Vec<String> = config.models().all_models().into_iter().collect();
    models.sort();
    let data: Vec<serde_json::Value> = models
        .into_iter()
        .filter(|m| !m.is_empty())
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "tiered-inference-gateway",
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": data}))
}

async fn health_store(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.health.snapshot()).unwrap_or_default())
}

async fn health_check() -> &'static str {
    "ok"
}
