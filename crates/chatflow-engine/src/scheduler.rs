//! Escalation scheduler
//!
//! Periodic sweep over durable waiting state. Each pass claims due waits
//! and overdue executions (lease-stamped, SKIP LOCKED in the Postgres
//! store) and hands each row to the orchestrator's retry/escalation and
//! overdue handlers. Multiple worker instances can run the sweep
//! concurrently; the lease plus the execution CAS keep every timer firing
//! at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use chatflow_storage::ExecutionStore;

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;

/// Sweep loop tuning, read from the environment
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    env: HashMap<String, String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let mut env = HashMap::new();
        for key in ["SWEEP_INTERVAL_SECS", "SWEEP_BATCH_SIZE", "SWEEP_LEASE_SECS"] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        Self { env }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.get_or("SWEEP_INTERVAL_SECS", 30))
    }

    pub fn batch_size(&self) -> i64 {
        self.get_or("SWEEP_BATCH_SIZE", 50) as i64
    }

    /// Lease must comfortably exceed one sweep pass so a slow pass never
    /// races its own claims.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.get_or("SWEEP_LEASE_SECS", 60))
    }

    fn get_or(&self, key: &str, default: u64) -> u64 {
        self.env
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
        }
    }
}

/// Counts from one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub due_waits: usize,
    pub overdue: usize,
}

/// Drives deadline timers against the durable waiting state
pub struct EscalationScheduler {
    store: Arc<dyn ExecutionStore>,
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        orchestrator: Arc<Orchestrator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    /// Run the sweep loop until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval().as_secs(),
            batch_size = self.config.batch_size(),
            "escalation scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("escalation scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval()) => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        error!(error = %e, "sweep pass failed");
                    }
                }
            }
        }
    }

    /// One sweep pass at an explicit `now` (deterministic in tests).
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepStats, EngineError> {
        let lease = self.config.lease();
        let batch = self.config.batch_size();
        let mut stats = SweepStats::default();

        let due = self.store.claim_due_waits(now, lease, batch).await?;
        for exec in due {
            let id = exec.id;
            match self.orchestrator.handle_due_wait(exec, now).await {
                Ok(()) => stats.due_waits += 1,
                // Per-row faults must not starve the rest of the batch
                Err(e) => error!(execution_id = %id, error = %e, "due-wait handling failed"),
            }
        }

        let overdue = self.store.claim_overdue_starts(now, lease, batch).await?;
        for exec in overdue {
            let id = exec.id;
            match self.orchestrator.handle_overdue(exec, now).await {
                Ok(()) => stats.overdue += 1,
                Err(e) => error!(execution_id = %id, error = %e, "overdue handling failed"),
            }
        }

        if stats != SweepStats::default() {
            debug!(
                due_waits = stats.due_waits,
                overdue = stats.overdue,
                "sweep pass complete"
            );
        }
        Ok(stats)
    }
}
