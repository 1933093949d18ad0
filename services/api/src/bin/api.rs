//! services/api/src/bin/api.rs

use api_lib::{
    config::Config,
    error::ApiError,
    startup::build_state,
    sweeper::spawn_session_sweeper,
    web::{self, rest::ApiDoc},
};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Build Storage Adapters & Shared AppState ---
    let app_state = build_state(config.clone()).await?;

    // --- 3. Start Background Tasks ---
    let shutdown = CancellationToken::new();
    let sweeper = spawn_session_sweeper(
        app_state.sessions.clone(),
        config.session_ttl,
        config.session_sweep_interval,
        shutdown.clone(),
    );

    // --- 4. Create the Web Router ---
    // The telephony platform posts from its own origins, so CORS stays permissive.
    let app = Router::new()
        .merge(web::router(app_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Voice webhook: POST http://{}{}/voice",
        config.bind_address, config.webhook_base_path
    );
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {:?}", e);
            }
            info!("Shutdown signal received.");
            server_shutdown.cancel();
        })
        .await?;

    // The sweeper may still be mid-tick if the server exited on its own.
    shutdown.cancel();
    sweeper
        .await
        .map_err(|e| ApiError::Internal(format!("Session sweeper panicked: {}", e)))?;
    info!("Server stopped.");
    Ok(())
}
