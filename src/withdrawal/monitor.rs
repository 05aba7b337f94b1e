//! Completion Monitor
//!
//! Bounded polling of the provider's transfer status. The first poll happens
//! one interval after start; with the defaults (10s × 30) the monitor gives up
//! after five minutes and leaves the withdrawal in TRANSFER_INITIATED for the
//! reconciliation sweep.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::adapters::TransferStatus;
use super::context::SagaContext;
use super::error::WithdrawalError;
use super::types::Withdrawal;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_attempts: 30,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Longest a single monitor run can take
    pub fn ceiling(&self) -> Duration {
        self.poll_interval() * self.max_attempts
    }
}

pub struct CompletionMonitor {
    ctx: SagaContext,
    config: MonitorConfig,
}

impl CompletionMonitor {
    pub fn new(ctx: SagaContext, config: MonitorConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Poll until the provider reports a terminal status.
    ///
    /// - `Ok(())`: completed and persisted (or already resolved elsewhere)
    /// - `TransferFailed`: provider said "failed"; the user has been notified
    ///   and the caller owns the FAILED transition
    /// - `MonitorTimeout`: no terminal status within the attempt budget
    pub async fn monitor(&self, withdrawal: &Withdrawal) -> Result<(), WithdrawalError> {
        let Some(transfer_id) = withdrawal.transfer_id.as_deref() else {
            return Err(WithdrawalError::Transfer(format!(
                "withdrawal {} has no transfer to monitor",
                withdrawal.id
            )));
        };

        debug!(
            withdrawal_id = %withdrawal.id,
            transfer_id,
            max_attempts = self.config.max_attempts,
            "Monitoring transfer"
        );

        for attempt in 1..=self.config.max_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;

            match self.ctx.transfer.get_transfer_status(transfer_id).await {
                Ok(TransferStatus::Completed) => {
                    self.ctx.complete(withdrawal).await?;
                    return Ok(());
                }
                Ok(TransferStatus::Failed(reason)) => {
                    let reason =
                        reason.unwrap_or_else(|| "transfer failed at provider".to_string());
                    info!(
                        withdrawal_id = %withdrawal.id,
                        transfer_id,
                        attempt,
                        reason = %reason,
                        "Provider reported transfer failed"
                    );
                    if let Err(e) = self
                        .ctx
                        .notifier
                        .notify_withdrawal_failed(withdrawal.user_id, withdrawal.amount, &reason)
                        .await
                    {
                        warn!(withdrawal_id = %withdrawal.id, error = %e, "Failure notification failed");
                    }
                    return Err(WithdrawalError::TransferFailed(reason));
                }
                Ok(TransferStatus::InProgress(status)) => {
                    debug!(withdrawal_id = %withdrawal.id, attempt, status = %status, "Transfer still in progress");
                }
                Err(e) => {
                    warn!(withdrawal_id = %withdrawal.id, attempt, error = %e, "Transfer status poll failed");
                }
            }
        }

        warn!(
            withdrawal_id = %withdrawal.id,
            transfer_id,
            attempts = self.config.max_attempts,
            "Transfer monitoring timed out, leaving for reconciliation"
        );
        Err(WithdrawalError::MonitorTimeout {
            attempts: self.config.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ceiling_is_five_minutes() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.ceiling(), Duration::from_secs(300));
    }
}
