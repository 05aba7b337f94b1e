//! Saga Worker Pool
//!
//! Consumes queued saga steps. Debit/transfer steps and monitor steps draw on
//! separate permit pools, and permits are taken inside the spawned task, so
//! long-running monitors cannot starve new debits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::error::WithdrawalError;
use super::orchestrator::SagaOrchestrator;
use super::queue::{SagaMessage, SagaReceiver, SagaStep};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent debit/transfer steps
    pub max_concurrent_steps: usize,
    /// Concurrent completion monitors
    pub max_concurrent_monitors: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 16,
            max_concurrent_monitors: 256,
        }
    }
}

pub struct SagaWorkerPool {
    orchestrator: Arc<SagaOrchestrator>,
    steps: Arc<Semaphore>,
    monitors: Arc<Semaphore>,
    config: WorkerConfig,
}

impl SagaWorkerPool {
    pub fn new(orchestrator: Arc<SagaOrchestrator>, config: WorkerConfig) -> Self {
        let config = WorkerConfig {
            max_concurrent_steps: config.max_concurrent_steps.max(1),
            max_concurrent_monitors: config.max_concurrent_monitors.max(1),
        };
        Self {
            orchestrator,
            steps: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            monitors: Arc::new(Semaphore::new(config.max_concurrent_monitors)),
            config,
        }
    }

    /// Dispatch messages until the queue closes or `shutdown` flips to true,
    /// then wait for in-flight steps to finish. Messages already buffered at
    /// shutdown are still dispatched.
    pub async fn run(&self, mut rx: SagaReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent_steps = self.config.max_concurrent_steps,
            max_concurrent_monitors = self.config.max_concurrent_monitors,
            "Starting saga worker pool"
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.dispatch(&mut tasks, msg),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping intake of new messages");
                    rx.close();
                    let mut buffered = 0usize;
                    while let Some(msg) = rx.recv().await {
                        self.dispatch(&mut tasks, msg);
                        buffered += 1;
                    }
                    debug!(buffered, "Dispatched buffered messages");
                    break;
                }
            }
        }

        info!(in_flight = tasks.len(), "Draining saga worker pool");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("Saga worker pool stopped");
    }

    /// Spawn the step; the task waits for its own permit so a full monitor
    /// pool never holds up debit/transfer dispatch
    fn dispatch(&self, tasks: &mut JoinSet<()>, msg: SagaMessage) {
        let pool = match msg.step {
            SagaStep::Monitor => self.monitors.clone(),
            SagaStep::Debit | SagaStep::Transfer => self.steps.clone(),
        };
        let orchestrator = self.orchestrator.clone();

        tasks.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                warn!(withdrawal_id = %msg.withdrawal_id, "Worker pool closed, dropping message");
                return;
            };
            if let Err(e) = orchestrator.handle(msg).await {
                log_step_error(&msg, &e);
            }
        });
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Saga step task panicked");
    }
}

/// Saga-step failures are already persisted on the record
fn log_step_error(msg: &SagaMessage, e: &WithdrawalError) {
    match e {
        WithdrawalError::CompensationFailed(_) => {
            // Compensator has raised the alert
            error!(withdrawal_id = %msg.withdrawal_id, step = %msg.step, error = %e, "Saga step left funds stranded");
        }
        WithdrawalError::Repository(_) | WithdrawalError::NotFound(_) => {
            error!(withdrawal_id = %msg.withdrawal_id, step = %msg.step, error = %e, "Saga step error");
        }
        _ => {
            debug!(withdrawal_id = %msg.withdrawal_id, step = %msg.step, code = e.code(), error = %e, "Saga step ended in failure");
        }
    }
}
