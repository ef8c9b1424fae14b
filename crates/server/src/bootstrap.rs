use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use zenthor_agent::delivery::{outbound_from_config, DeliveryError, OutboundChannel};
use zenthor_agent::gateway::OpenAiCompatibleGateway;
use zenthor_agent::maintenance::{Maintenance, MaintenanceSettings};
use zenthor_agent::replies::InboundHandler;
use zenthor_agent::runtime::{AgentStores, JobLoop, JobLoopSettings};
use zenthor_agent::tools::builtin_tools;
use zenthor_core::config::{AppConfig, ConfigError, LoadOptions};
use zenthor_core::errors::ModelError;
use zenthor_db::repositories::{
    SqlApprovalRepository, SqlConversationRepository, SqlJobQueue, SqlScheduleRepository,
};
use zenthor_db::{connect_with_settings, migrations, DbPool};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub outbound: Arc<dyn OutboundChannel>,
    pub job_loop: Arc<JobLoop>,
    pub maintenance: Arc<Maintenance>,
    pub inbound: Arc<InboundHandler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model gateway setup failed: {0}")]
    Gateway(#[source] ModelError),
    #[error("outbound channel setup failed: {0}")]
    Delivery(#[source] DeliveryError),
    #[error("tool setup failed: {0}")]
    Tools(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let stores = AgentStores {
        jobs: Arc::new(SqlJobQueue::new(db_pool.clone())),
        conversations: conversations.clone(),
        messages: conversations,
        approvals: Arc::new(SqlApprovalRepository::new(db_pool.clone())),
        schedules: Arc::new(SqlScheduleRepository::new(db_pool.clone())),
    };

    let gateway =
        OpenAiCompatibleGateway::from_config(&config.llm).map_err(BootstrapError::Gateway)?;
    let outbound = outbound_from_config(&config.delivery).map_err(BootstrapError::Delivery)?;
    info!(
        event_name = "system.bootstrap.outbound_ready",
        correlation_id = "bootstrap",
        transport = outbound.transport_name(),
        "outbound channel initialized"
    );

    let job_loop = JobLoop::new(
        stores.clone(),
        Arc::new(gateway),
        outbound.clone(),
        builtin_tools().map_err(BootstrapError::Tools)?,
        JobLoopSettings::from_config(&config),
    );
    let maintenance =
        Maintenance::new(stores.clone(), MaintenanceSettings::from_config(&config.agent));
    let inbound = InboundHandler::new(
        stores.conversations.clone(),
        stores.messages.clone(),
        stores.approvals.clone(),
        stores.jobs.clone(),
    );

    Ok(Application {
        config,
        db_pool,
        outbound,
        job_loop: Arc::new(job_loop),
        maintenance: Arc::new(maintenance),
        inbound: Arc::new(inbound),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use zenthor_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_the_noop_transport() {
        let dir = TempDir::new().expect("temp dir");
        let database_url = format!("sqlite://{}", dir.path().join("zenthor.db").display());
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with defaults");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' \
             AND name IN ('conversation', 'message', 'agent_job', 'tool_approval', 'scheduled_task')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("tables should be listed");
        assert_eq!(table_count, 5);
        assert_eq!(app.outbound.transport_name(), "noop");

        let report = app.job_loop.process_batch().await.expect("empty batch");
        assert_eq!(report.processed(), 0);
        let triggered =
            app.maintenance.process_due_tasks(chrono::Utc::now()).await.expect("no due tasks");
        assert_eq!(triggered, 0);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_database_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("postgres://localhost/zenthor".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
    }
}
