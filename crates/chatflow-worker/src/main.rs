// Chatflow escalation worker
//
// Runs the periodic deadline sweep against the shared database: retry
// nudges, escalations and overdue notifications. Any number of worker
// instances can run concurrently; sweep leases and the execution CAS keep
// every timer firing at most once.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatflow_engine::{
    CollaboratorConfig, Collaborators, EscalationScheduler, Orchestrator, SchedulerConfig,
};
use chatflow_storage::{ExecutionStore, PostgresExecutionStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("chatflow-worker starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresExecutionStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let collaborators = Collaborators::http(&CollaboratorConfig::from_env());
    let store: Arc<dyn ExecutionStore> = Arc::new(store);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), collaborators));

    let config = SchedulerConfig::from_env();
    let scheduler = EscalationScheduler::new(store, orchestrator, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
