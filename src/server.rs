use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::api;
use crate::config::AppConfig;
use crate::history::HistoryLog;
use crate::llm::AdapterRegistry;
use crate::runtime::{AgentServices, RunSettings};
use crate::session::SessionStore;
use crate::undo::UndoCoordinator;

/// Build the process-wide services from configuration.
pub async fn build_services(config: &AppConfig) -> AgentServices {
    let adapters = AdapterRegistry::from_config(&config.providers, config.agent.max_steps);
    if adapters.is_empty() {
        tracing::warn!("No provider configured; runs will be refused until one is set up");
    }

    let session = SessionStore::open(&config.state_dir()).await;
    let history = HistoryLog::new(config.history.capacity);
    let undo = UndoCoordinator::git(vec![state_dir_prefix(&config.project.state_dir)]);

    AgentServices::new(
        adapters,
        session,
        history,
        undo,
        RunSettings::from_config(config),
    )
}

/// The state directory as a project-relative path prefix.
fn state_dir_prefix(state_dir: &str) -> String {
    state_dir
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string()
}

/// Router with state and HTTP layers applied.
pub fn build_app(state: AppState) -> Router {
    api::router()
        // The overlay is injected into the dev server's origin.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    info!(
        name: "project.config.loaded",
        project_dir = %config.project.dir.display(),
        dev_server_port = ?config.dev_server.port,
        provider = %config.agent.provider,
        "Project configuration loaded"
    );

    let services = build_services(&config).await.shared();
    for id in services.adapters.ids() {
        info!(
            name: "provider.registered",
            provider = %id,
            self_contained = services.adapters.is_self_contained(&id),
            "Provider available"
        );
    }

    let state = AppState::new(services, Arc::clone(&config));
    let runs = Arc::clone(&state.runs);
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!(name: "server.stopping", "Shutting down");
            runs.cancel().await;
        })
        .await?;
    Ok(())
}
