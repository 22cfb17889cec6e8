//! Main Entrypoint for the Voxline Agent Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the system prompt.
//! 3. Building the shared collaborators every session is assembled from.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use voxline_agent::{config::Config, router::create_router, state::AppState};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            prompts.insert(prompt_key, fs::read_to_string(&path)?);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Load Prompts ---
    let mut prompts = load_prompts(&config.prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", config.prompts_path.display()))?;
    let system_prompt = prompts
        .remove("system_prompt")
        .context("system_prompt.md not found in prompts directory")?;

    // --- 3. Initialize Shared Services ---
    let provider = config.provider.clone();
    let chat_model = config.chat_model.clone();
    let bind_address = config.bind_address;
    let app_state = Arc::new(AppState::new(config, system_prompt)?);

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        ?provider,
        model = %chat_model,
        %bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
