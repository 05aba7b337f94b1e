//! Shared Saga Context
//!
//! Collaborators used by the orchestrator, the completion monitor and the
//! reconciliation sweep, plus the resolution paths they share (complete,
//! fail, compensate-then-fail).

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::adapters::{ProtectedLedger, ProtectedTransfer};
use super::compensation::Compensator;
use super::error::WithdrawalError;
use super::guards::Notifier;
use super::repository::WithdrawalRepository;
use super::types::{Withdrawal, WithdrawalId};
use crate::config::SagaConfig;

/// Outcome of resolving a withdrawal to a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call performed the transition
    Applied,
    /// Another worker resolved it first
    AlreadyResolved,
}

#[derive(Clone)]
pub struct SagaContext {
    pub repo: Arc<dyn WithdrawalRepository>,
    pub ledger: ProtectedLedger,
    pub transfer: ProtectedTransfer,
    pub notifier: Arc<dyn Notifier>,
    pub config: SagaConfig,
}

impl SagaContext {
    pub fn new(
        repo: Arc<dyn WithdrawalRepository>,
        ledger: ProtectedLedger,
        transfer: ProtectedTransfer,
        notifier: Arc<dyn Notifier>,
        config: SagaConfig,
    ) -> Self {
        Self {
            repo,
            ledger,
            transfer,
            notifier,
            config,
        }
    }

    pub fn compensator(&self) -> Compensator {
        Compensator::new(self.ledger.clone(), self.config.system_account_id.clone())
    }

    /// Load a withdrawal or fail with NotFound
    pub async fn load(&self, id: WithdrawalId) -> Result<Withdrawal, WithdrawalError> {
        self.repo
            .get_by_id(id)
            .await?
            .ok_or(WithdrawalError::NotFound(id))
    }

    /// Mark COMPLETED and notify. Notifications fire only for the caller
    /// that performed the transition.
    pub async fn complete(&self, withdrawal: &Withdrawal) -> Result<Resolution, WithdrawalError> {
        if !self.repo.mark_completed(withdrawal.id).await? {
            debug!(withdrawal_id = %withdrawal.id, "Withdrawal already resolved, skipping completion");
            return Ok(Resolution::AlreadyResolved);
        }

        info!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            amount = %withdrawal.amount,
            "Withdrawal completed"
        );

        if let Err(e) = self
            .notifier
            .notify_withdrawal_completed(withdrawal.user_id, withdrawal.amount)
            .await
        {
            warn!(withdrawal_id = %withdrawal.id, error = %e, "Completion notification failed");
        }

        if withdrawal.amount >= self.config.large_withdrawal_threshold {
            let new_balance = match self.ledger.get_account(&withdrawal.source_account_id).await {
                Ok(account) => Some(account.buying_power),
                Err(e) => {
                    debug!(withdrawal_id = %withdrawal.id, error = %e, "Balance lookup for alert failed");
                    None
                }
            };
            if let Err(e) = self
                .notifier
                .notify_large_balance_change(
                    withdrawal.user_id,
                    "withdrawal",
                    withdrawal.amount,
                    new_balance,
                )
                .await
            {
                warn!(withdrawal_id = %withdrawal.id, error = %e, "Balance-change alert failed");
            }
        }

        Ok(Resolution::Applied)
    }

    /// Mark FAILED with `reason`; notify when `notify` is set and the
    /// transition was ours
    pub async fn fail(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
        notify: bool,
    ) -> Result<Resolution, WithdrawalError> {
        if !self.repo.mark_failed(withdrawal.id, reason).await? {
            debug!(withdrawal_id = %withdrawal.id, "Withdrawal already resolved, skipping failure");
            return Ok(Resolution::AlreadyResolved);
        }

        warn!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            reason,
            "Withdrawal failed"
        );

        if notify
            && let Err(e) = self
                .notifier
                .notify_withdrawal_failed(withdrawal.user_id, withdrawal.amount, reason)
                .await
        {
            warn!(withdrawal_id = %withdrawal.id, error = %e, "Failure notification failed");
        }

        Ok(Resolution::Applied)
    }

    /// Reverse the debit, then mark FAILED.
    ///
    /// On reversal failure the record is still marked FAILED, with both errors
    /// in the reason, and `CompensationFailed` is returned. Nothing retries it.
    pub async fn compensate_and_fail(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
        notify: bool,
    ) -> Result<Resolution, WithdrawalError> {
        match self.compensator().reverse_debit(withdrawal).await {
            Ok(_) => self.fail(withdrawal, reason, notify).await,
            Err(comp_err) => {
                let combined = format!("{}; {}", reason, comp_err);
                if let Err(e) = self.fail(withdrawal, &combined, notify).await {
                    error!(
                        alert = "STRANDED_FUNDS",
                        withdrawal_id = %withdrawal.id,
                        error = %e,
                        "Failed to persist FAILED after compensation failure"
                    );
                }
                Err(comp_err)
            }
        }
    }
}
