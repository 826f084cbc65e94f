use std::sync::Arc;

use anyhow::Context;

use onboarding_orchestrator::collaborators::HttpCollaborators;
use onboarding_orchestrator::config::OrchestratorConfig;
use onboarding_orchestrator::error::ConfigError;
use onboarding_orchestrator::store::{LibSqlBackend, WorkflowStore};
use onboarding_orchestrator::workflow::routes::{AppState, workflow_routes};
use onboarding_orchestrator::workflow::{EventChannel, StepExecutor, WorkflowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::MissingEnvVar(key)) => {
            eprintln!("Error: {key} not set");
            eprintln!("  export {key}=http://localhost:9000");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    eprintln!("📋 Onboarding Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Collaborators: {}", config.collaborator_url);
    eprintln!("   API: http://0.0.0.0:{}/api/workflows", config.http_port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/workflows/{{id}}", config.http_port);
    eprintln!(
        "   Steps: timeout {}s, {} attempt(s)",
        config.step_timeout.as_secs(),
        config.step_max_attempts
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn WorkflowStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Engine ───────────────────────────────────────────────────────────
    let collaborators = Arc::new(HttpCollaborators::new(config.collaborator_url.clone()));
    let executor = Arc::new(StepExecutor::new(
        collaborators,
        config.step_timeout,
        config.retry_policy(),
    ));
    let events = EventChannel::new(config.event_capacity);
    let engine = WorkflowEngine::new(store, executor, events);

    // ── Startup Recovery ─────────────────────────────────────────────────
    let report = engine.recover().await.context("Workflow recovery failed")?;
    if !report.interrupted.is_empty() || !report.resumed.is_empty() {
        eprintln!(
            "   Recovered {} workflow(s), {} interrupted step(s) marked failed",
            report.resumed.len(),
            report.interrupted.len()
        );
    }
    eprintln!();

    // ── HTTP / WS ────────────────────────────────────────────────────────
    let app = workflow_routes(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Onboarding orchestrator listening");
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}
