use std::sync::Arc;

use anyhow::Context;

use cubeflow_infra::config::EngineConfig;
use cubeflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = std::env::var("CUBEFLOW_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or_default();
    cubeflow_observability::init_with(log_format, cubeflow_observability::logging::DEFAULT_FILTER);

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let bind_addr = config.bind_addr.clone();

    let services = Arc::new(cubeflow_api::app::services::build_services(config).await?);
    let app = cubeflow_api::app::router(services.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || services.shutdown_workers()).await?;
    tracing::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
