use anyhow::{Context, Result};
use liveworld::api::{create_app, AppContext};
use liveworld::config::LiveWorldConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liveworld=info".into()),
        )
        .init();

    info!("LiveWorld starting...");

    let config = LiveWorldConfig::load().context("Failed to load configuration")?;
    info!(
        bind_addr = %config.server.bind_addr,
        static_dir = %config.server.static_dir.display(),
        max_body_bytes = config.api.max_body_bytes,
        "Configuration loaded"
    );

    let ctx = AppContext::new();
    let router = create_app(&ctx, &config);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "LiveWorld listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!(
        entities = ctx.store.len(),
        subscribers = ctx.registry.len(),
        "LiveWorld stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
