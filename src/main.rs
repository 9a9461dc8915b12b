//! Overlay Agent Server
//!
//! Entry point for the dev-server overlay agent.

use std::sync::Arc;

use mimalloc::MiMalloc;

use overlay_agent::config::AppConfig;
use overlay_agent::{server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before anything reads the environment.
    let _ = dotenvy::dotenv();

    // Initialize tracing (M-LOG-STRUCTURED)
    telemetry::init();

    let config = match AppConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    server::start_server(config).await
}
