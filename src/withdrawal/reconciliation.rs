//! Reconciliation Sweep
//!
//! Background job that finds withdrawals stuck beyond the SLA threshold and
//! resolves them by asking the provider directly (status-enquiry pattern).
//! TIMEOUT is the parking state for anything it cannot resolve yet; the next
//! scan enquires again.
//!
//! With a queue attached it also redelivers the next step for PENDING and
//! PROCESSING withdrawals that stopped moving inside the SLA window (queue
//! messages lost to a restart). Step handlers are idempotent, so a duplicate
//! delivery is harmless.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::adapters::TransferStatus;
use super::context::{Resolution, SagaContext};
use super::error::WithdrawalError;
use super::queue::{SagaMessage, SagaQueue, SagaStep};
use super::state::WithdrawalStatus;
use super::types::Withdrawal;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// How often to scan
    pub scan_interval_secs: u64,
    /// Age after which a non-terminal withdrawal counts as stuck
    pub sla_threshold_secs: u64,
    /// Maximum withdrawals per scan
    pub batch_size: usize,
    /// Status enquiries in flight at once
    pub concurrency: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            sla_threshold_secs: 900,
            batch_size: 100,
            concurrency: 8,
        }
    }
}

impl ReconciliationConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn sla_threshold(&self) -> Duration {
        Duration::from_secs(self.sla_threshold_secs)
    }
}

/// Per-scan counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Already resolved elsewhere or left as is
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    TimedOut,
    Unchanged,
}

pub struct ReconciliationSweep {
    ctx: SagaContext,
    config: ReconciliationConfig,
    queue: Option<Arc<dyn SagaQueue>>,
}

impl ReconciliationSweep {
    pub fn new(ctx: SagaContext, config: ReconciliationConfig) -> Self {
        Self {
            ctx,
            config,
            queue: None,
        }
    }

    /// Redeliver stalled steps through `queue` on every scan
    pub fn with_queue(mut self, queue: Arc<dyn SagaQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Re-enqueue the next step for PENDING / PROCESSING withdrawals younger
    /// than the SLA that have not been touched for `idle`. Returns the number
    /// of messages queued.
    pub async fn redeliver_stalled(&self, idle: Duration) -> Result<usize, WithdrawalError> {
        let Some(queue) = &self.queue else {
            return Ok(0);
        };

        let stalled = self
            .ctx
            .repo
            .get_stalled_withdrawals(idle, self.config.sla_threshold(), self.config.batch_size)
            .await?;

        let mut queued = 0;
        for withdrawal in &stalled {
            let step = if withdrawal.status == WithdrawalStatus::Processing && withdrawal.is_debited()
            {
                SagaStep::Transfer
            } else {
                SagaStep::Debit
            };
            match queue.enqueue(SagaMessage::new(withdrawal.id, step)).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(withdrawal_id = %withdrawal.id, step = %step, error = %e, "Failed to redeliver stalled step");
                }
            }
        }

        if queued > 0 {
            info!(count = queued, "Redelivered stalled saga steps");
        }
        Ok(queued)
    }

    /// Run forever, one sweep per scan interval
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            sla_threshold_secs = self.config.sla_threshold_secs,
            "Starting reconciliation sweep"
        );

        loop {
            if let Err(e) = self.redeliver_stalled(self.config.scan_interval()).await {
                error!(error = %e, "Stalled-step redelivery failed");
            }
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Reconciliation scan failed");
            }

            tokio::time::sleep(self.config.scan_interval()).await;
        }
    }

    /// Run a single scan
    pub async fn sweep_once(&self) -> Result<ReconciliationReport, WithdrawalError> {
        let stuck = self
            .ctx
            .repo
            .get_stuck_withdrawals(self.config.sla_threshold(), self.config.batch_size)
            .await?;

        let mut report = ReconciliationReport::default();
        if stuck.is_empty() {
            debug!("No stuck withdrawals found");
            return Ok(report);
        }

        info!(count = stuck.len(), "Found stuck withdrawals to reconcile");

        let outcomes: Vec<_> = stream::iter(stuck)
            .map(|withdrawal| async move {
                let outcome = self.reconcile(&withdrawal).await;
                (withdrawal, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (withdrawal, outcome) in outcomes {
            report.examined += 1;
            match outcome {
                Ok(Outcome::Completed) => report.completed += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::TimedOut) => report.timed_out += 1,
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(withdrawal_id = %withdrawal.id, error = %e, "Failed to reconcile withdrawal");
                }
            }
        }

        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            timed_out = report.timed_out,
            errors = report.errors,
            "Reconciliation scan finished"
        );
        Ok(report)
    }

    async fn reconcile(&self, withdrawal: &Withdrawal) -> Result<Outcome, WithdrawalError> {
        let Some(transfer_id) = withdrawal.transfer_id.as_deref() else {
            return self.reconcile_without_transfer(withdrawal).await;
        };

        match self.ctx.transfer.get_transfer_status(transfer_id).await {
            Ok(TransferStatus::Completed) => Ok(match self.ctx.complete(withdrawal).await? {
                Resolution::Applied => Outcome::Completed,
                Resolution::AlreadyResolved => Outcome::Unchanged,
            }),
            Ok(TransferStatus::Failed(reason)) => {
                let reason = format!(
                    "reconciliation: provider reported failed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                let resolution = if self.ctx.config.compensate_provider_failures {
                    self.ctx.compensate_and_fail(withdrawal, &reason, true).await?
                } else {
                    self.ctx.fail(withdrawal, &reason, true).await?
                };
                Ok(match resolution {
                    Resolution::Applied => Outcome::Failed,
                    Resolution::AlreadyResolved => Outcome::Unchanged,
                })
            }
            Ok(TransferStatus::InProgress(status)) => {
                self.timeout(
                    withdrawal,
                    &format!("provider status '{}' beyond SLA", status),
                )
                .await
            }
            Err(e) => {
                warn!(withdrawal_id = %withdrawal.id, transfer_id, error = %e, "Status enquiry failed");
                self.timeout(withdrawal, &format!("status enquiry failed: {}", e))
                    .await
            }
        }
    }

    async fn reconcile_without_transfer(
        &self,
        withdrawal: &Withdrawal,
    ) -> Result<Outcome, WithdrawalError> {
        // Already parked; nothing new to learn without a transfer
        if withdrawal.status == WithdrawalStatus::Timeout {
            return Ok(Outcome::Unchanged);
        }

        if let Some(journal_id) = withdrawal.ledger_journal_id.as_deref() {
            error!(
                alert = "STRANDED_FUNDS",
                withdrawal_id = %withdrawal.id,
                journal_id,
                amount = %withdrawal.amount,
                "Debited withdrawal never reached the provider"
            );
        }

        self.timeout(withdrawal, "no transfer initiated within SLA")
            .await
    }

    async fn timeout(&self, withdrawal: &Withdrawal, reason: &str) -> Result<Outcome, WithdrawalError> {
        if self.ctx.repo.mark_timeout(withdrawal.id, reason).await? {
            info!(withdrawal_id = %withdrawal.id, reason, "Withdrawal marked TIMEOUT");
            Ok(Outcome::TimedOut)
        } else {
            Ok(Outcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ReconciliationConfig::default();
        assert_eq!(config.sla_threshold(), Duration::from_secs(15 * 60));
        assert_eq!(config.scan_interval(), Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.concurrency, 8);
    }
}
