//! Saga Orchestrator
//!
//! Handles one queued step at a time. Every handler re-reads the persisted
//! record before any externally visible call, so redelivered messages are
//! harmless:
//!
//! - debit: skipped once a journal ID is recorded
//! - transfer: skipped once a transfer ID is recorded
//! - monitor: only runs while TRANSFER_INITIATED
//!
//! External calls carry the withdrawal ID as idempotency reference, covering
//! the window between a successful call and persisting its result.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::adapters::{CASH_JOURNAL, JournalRequest, TransferInstruction};
use super::context::SagaContext;
use super::error::{WithdrawalError, ledger_error, transfer_error};
use super::monitor::{CompletionMonitor, MonitorConfig};
use super::queue::{SagaMessage, SagaQueue, SagaStep};
use super::state::WithdrawalStatus;
use super::types::{Withdrawal, WithdrawalId};

pub struct SagaOrchestrator {
    ctx: SagaContext,
    monitor: CompletionMonitor,
    queue: Arc<dyn SagaQueue>,
}

impl SagaOrchestrator {
    pub fn new(ctx: SagaContext, queue: Arc<dyn SagaQueue>, monitor_config: MonitorConfig) -> Self {
        Self {
            monitor: CompletionMonitor::new(ctx.clone(), monitor_config),
            ctx,
            queue,
        }
    }

    pub fn context(&self) -> &SagaContext {
        &self.ctx
    }

    /// Dispatch one queue message
    pub async fn handle(&self, msg: SagaMessage) -> Result<(), WithdrawalError> {
        debug!(withdrawal_id = %msg.withdrawal_id, step = %msg.step, "Handling saga step");
        match msg.step {
            SagaStep::Debit => self.handle_debit(msg.withdrawal_id).await,
            SagaStep::Transfer => self.handle_transfer(msg.withdrawal_id).await,
            SagaStep::Monitor => self.handle_monitor(msg.withdrawal_id).await,
        }
    }

    // ========================================================================
    // Debit
    // ========================================================================

    async fn handle_debit(&self, id: WithdrawalId) -> Result<(), WithdrawalError> {
        let withdrawal = self.ctx.load(id).await?;

        let withdrawal = match withdrawal.status {
            WithdrawalStatus::Pending => {
                if !self
                    .ctx
                    .repo
                    .update_status(id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
                    .await?
                {
                    debug!(withdrawal_id = %id, "Lost PENDING -> PROCESSING race, skipping");
                    return Ok(());
                }
                Withdrawal {
                    status: WithdrawalStatus::Processing,
                    ..withdrawal
                }
            }
            // Redelivery after a crash mid-saga
            WithdrawalStatus::Processing => withdrawal,
            other => {
                debug!(withdrawal_id = %id, status = %other, "Debit step not applicable, skipping");
                return Ok(());
            }
        };

        let withdrawal = if withdrawal.is_debited() {
            debug!(withdrawal_id = %id, "Ledger already debited, skipping journal");
            withdrawal
        } else {
            match self.debit(&withdrawal).await? {
                Some(w) => w,
                None => return Ok(()),
            }
        };

        self.initiate_transfer(&withdrawal).await
    }

    /// Journal source → system account. Returns the updated record, or `None`
    /// when the saga must stop here.
    async fn debit(&self, withdrawal: &Withdrawal) -> Result<Option<Withdrawal>, WithdrawalError> {
        let req = JournalRequest {
            from_account: withdrawal.source_account_id.clone(),
            to_account: self.ctx.config.system_account_id.clone(),
            entry_type: CASH_JOURNAL.to_string(),
            amount: withdrawal.amount,
            description: format!("Withdrawal {}", withdrawal.id),
            reference: withdrawal.id.to_string(),
        };

        let receipt = match self.ctx.ledger.create_journal(&req).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let err = ledger_error(e);
                warn!(withdrawal_id = %withdrawal.id, error = %err, "Ledger debit failed");
                self.ctx.fail(withdrawal, &err.to_string(), true).await?;
                return Err(err);
            }
        };

        info!(
            withdrawal_id = %withdrawal.id,
            journal_id = %receipt.journal_id,
            amount = %withdrawal.amount,
            "Ledger debited"
        );

        let debited = Withdrawal {
            ledger_journal_id: Some(receipt.journal_id.clone()),
            ..withdrawal.clone()
        };

        if self
            .ctx
            .repo
            .update_ledger_journal(withdrawal.id, &receipt.journal_id)
            .await?
        {
            return Ok(Some(debited));
        }

        // Journal booked but not recorded: find out why
        let current = self.ctx.load(withdrawal.id).await?;
        match current.status {
            WithdrawalStatus::Cancelled => {
                // Cancelled while the journal call was in flight
                warn!(withdrawal_id = %withdrawal.id, "Withdrawal cancelled during debit, reversing journal");
                self.ctx.compensator().reverse_debit(&debited).await?;
                Ok(None)
            }
            WithdrawalStatus::Timeout if current.transfer_id.is_none() => {
                // Parked by the sweep while the journal call was in flight.
                // No transfer exists, so the debit can be undone here.
                warn!(withdrawal_id = %withdrawal.id, "Withdrawal parked during debit, reversing journal");
                let parked = Withdrawal {
                    ledger_journal_id: Some(receipt.journal_id.clone()),
                    ..current
                };
                let reason = format!(
                    "debit journal {} booked after withdrawal timed out",
                    receipt.journal_id
                );
                self.ctx.compensate_and_fail(&parked, &reason, true).await?;
                Ok(None)
            }
            WithdrawalStatus::Processing if current.is_debited() => Ok(Some(current)),
            other => {
                error!(
                    alert = "STRANDED_FUNDS",
                    withdrawal_id = %withdrawal.id,
                    journal_id = %receipt.journal_id,
                    status = %other,
                    "Debit journal could not be recorded"
                );
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Transfer
    // ========================================================================

    async fn handle_transfer(&self, id: WithdrawalId) -> Result<(), WithdrawalError> {
        let withdrawal = self.ctx.load(id).await?;
        if withdrawal.status != WithdrawalStatus::Processing || !withdrawal.is_debited() {
            debug!(withdrawal_id = %id, status = %withdrawal.status, "Transfer step not applicable, skipping");
            return Ok(());
        }
        self.initiate_transfer(&withdrawal).await
    }

    async fn initiate_transfer(&self, withdrawal: &Withdrawal) -> Result<(), WithdrawalError> {
        if withdrawal.transfer_id.is_some() {
            debug!(withdrawal_id = %withdrawal.id, "Transfer already initiated, skipping");
            return Ok(());
        }

        let instruction = TransferInstruction {
            user_id: withdrawal.user_id,
            source_account_id: withdrawal.source_account_id.clone(),
            amount: withdrawal.amount,
            destination_chain: withdrawal.destination_chain.clone(),
            destination_address: withdrawal.destination_address.clone(),
            reference: withdrawal.id.to_string(),
        };

        let receipt = match self.ctx.transfer.process_withdrawal(&instruction).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let err = transfer_error(e);
                warn!(
                    withdrawal_id = %withdrawal.id,
                    error = %err,
                    "Transfer initiation failed, compensating debit"
                );
                self.ctx
                    .compensate_and_fail(withdrawal, &err.to_string(), true)
                    .await?;
                return Err(err);
            }
        };

        if !self
            .ctx
            .repo
            .update_transfer_details(withdrawal.id, &receipt.transfer_id, &receipt.recipient_id)
            .await?
        {
            let current = self.ctx.load(withdrawal.id).await?;
            if current.transfer_id.as_deref() != Some(receipt.transfer_id.as_str()) {
                error!(
                    alert = "STRANDED_FUNDS",
                    withdrawal_id = %withdrawal.id,
                    transfer_id = %receipt.transfer_id,
                    status = %current.status,
                    "Transfer created but could not be recorded"
                );
            }
            return Ok(());
        }

        info!(
            withdrawal_id = %withdrawal.id,
            transfer_id = %receipt.transfer_id,
            recipient_id = %receipt.recipient_id,
            provider_status = %receipt.status,
            "Transfer initiated"
        );

        if let Err(e) = self
            .queue
            .enqueue(SagaMessage::new(withdrawal.id, SagaStep::Monitor))
            .await
        {
            warn!(
                withdrawal_id = %withdrawal.id,
                error = %e,
                "Failed to enqueue monitor step, reconciliation will resolve"
            );
        }

        Ok(())
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    async fn handle_monitor(&self, id: WithdrawalId) -> Result<(), WithdrawalError> {
        let withdrawal = self.ctx.load(id).await?;
        if withdrawal.status != WithdrawalStatus::TransferInitiated {
            debug!(withdrawal_id = %id, status = %withdrawal.status, "Monitor step not applicable, skipping");
            return Ok(());
        }

        match self.monitor.monitor(&withdrawal).await {
            Ok(()) => Ok(()),
            Err(WithdrawalError::TransferFailed(reason)) => {
                // Monitor has already notified the user
                if self.ctx.config.compensate_provider_failures {
                    self.ctx
                        .compensate_and_fail(&withdrawal, &reason, false)
                        .await?;
                } else {
                    self.ctx.fail(&withdrawal, &reason, false).await?;
                }
                Err(WithdrawalError::TransferFailed(reason))
            }
            Err(WithdrawalError::MonitorTimeout { attempts }) => {
                debug!(withdrawal_id = %id, attempts, "Monitor window elapsed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
