//! Main entry point for the LLM Stream Gateway

use llm_stream_gateway::{
    api,
    config::{ConfigPaths, LoggingConfig, Settings},
    AppState,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Load configuration
    let paths = ConfigPaths::from_env();
    let settings = Settings::load(&paths)?;

    init_tracing(&settings.logging);
    info!(
        config = %paths.gateway.display(),
        backends = settings.get_enabled_backends().len(),
        "Starting LLM Stream Gateway"
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let app_state = Arc::new(AppState::new(settings, Some(paths))?);

    // Start health check background task
    let health_task = app_state.health_manager.start();

    // Build the router
    let app = api::create_router(app_state.clone());

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.health_manager.stop();
    let _ = health_task.await;

    Ok(())
}
