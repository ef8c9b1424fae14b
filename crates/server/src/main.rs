mod bootstrap;
mod health;
mod inbound;

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use zenthor_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use zenthor_core::config::LogFormat::*;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let routes = health::router(app.db_pool.clone()).merge(inbound::router(app.inbound.clone()));
    health::spawn(&app.config.server.bind_address, app.config.server.health_check_port, routes)
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let job_loop = app.job_loop.clone();
    let maintenance = app.maintenance.clone();
    let maintenance_shutdown = shutdown_rx.clone();
    let housekeeping = tokio::spawn(async move { maintenance.run(maintenance_shutdown).await });
    let mut worker = tokio::spawn(async move { job_loop.run(shutdown_rx).await });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        worker_id = %app.config.agent.worker_id,
        transport = app.outbound.transport_name(),
        "zenthor-server started"
    );

    tokio::select! {
        signal = wait_for_shutdown() => signal?,
        joined = &mut worker => {
            tracing::error!(
                event_name = "system.server.worker_exited",
                correlation_id = "shutdown",
                clean = joined.is_ok(),
                "job loop exited before shutdown was requested"
            );
            let _ = shutdown_tx.send(true);
            let _ = housekeeping.await;
            app.db_pool.close().await;
            return Ok(());
        }
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "zenthor-server stopping"
    );
    // receiver may already be gone if the loop exited
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, worker).await {
        Ok(_) => tracing::info!(
            event_name = "system.server.stopped",
            correlation_id = "shutdown",
            "job loop drained"
        ),
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "job loop still busy at shutdown deadline"
        ),
    }

    let _ = housekeeping.await;
    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
