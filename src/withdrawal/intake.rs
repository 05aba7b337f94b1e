//! Withdrawal Intake
//!
//! Synchronous entry point. Validates a request against limits, allocation
//! mode and effective balance (buying power minus in-flight withdrawals),
//! persists it in PENDING and queues the debit step. Rejections have no side
//! effects beyond the declined-spending audit and notification.
//!
//! Intake for one user is serialized by an in-process lock so two concurrent
//! requests cannot both pass the pending-aggregate balance check.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::adapters::ProtectedLedger;
use super::error::{WithdrawalError, ledger_error};
use super::guards::{AllocationGuard, AuditLogger, LimitsGuard, Notifier};
use super::queue::{SagaMessage, SagaQueue, SagaStep};
use super::repository::WithdrawalRepository;
use super::state::WithdrawalStatus;
use super::types::{InitiatedWithdrawal, UserId, Withdrawal, WithdrawalId, WithdrawalRequest};

/// Page size cap for `list_withdrawals`
pub const MAX_PAGE_SIZE: usize = 100;

const DECLINE_REASON: &str = "allocation mode does not permit this spend";

pub struct WithdrawalIntake {
    repo: Arc<dyn WithdrawalRepository>,
    ledger: ProtectedLedger,
    limits: Arc<dyn LimitsGuard>,
    allocation: Arc<dyn AllocationGuard>,
    audit: Arc<dyn AuditLogger>,
    notifier: Arc<dyn Notifier>,
    queue: Arc<dyn SagaQueue>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl WithdrawalIntake {
    pub fn new(
        repo: Arc<dyn WithdrawalRepository>,
        ledger: ProtectedLedger,
        limits: Arc<dyn LimitsGuard>,
        allocation: Arc<dyn AllocationGuard>,
        audit: Arc<dyn AuditLogger>,
        notifier: Arc<dyn Notifier>,
        queue: Arc<dyn SagaQueue>,
    ) -> Self {
        Self {
            repo,
            ledger,
            limits,
            allocation,
            audit,
            notifier,
            queue,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().value().clone()
    }

    fn validate(req: &WithdrawalRequest) -> Result<(), WithdrawalError> {
        if req.amount <= Decimal::ZERO {
            return Err(WithdrawalError::InvalidAmount);
        }
        if req.destination_chain.trim().is_empty() {
            return Err(WithdrawalError::InvalidDestination(
                "destination chain is required".to_string(),
            ));
        }
        if req.destination_address.trim().is_empty() {
            return Err(WithdrawalError::InvalidDestination(
                "destination address is required".to_string(),
            ));
        }
        if req.source_account_id.trim().is_empty() {
            return Err(WithdrawalError::InvalidSourceAccount(
                "source account is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Accept a withdrawal request
    pub async fn initiate_withdrawal(
        &self,
        req: WithdrawalRequest,
    ) -> Result<InitiatedWithdrawal, WithdrawalError> {
        Self::validate(&req)?;

        let lock = self.user_lock(req.user_id);
        let _guard = lock.lock().await;

        // 1. In-flight withdrawals
        let pending_total = self.repo.get_pending_withdrawals_total(req.user_id).await?;

        // 2. Tiered limits
        let check = self
            .limits
            .validate_withdrawal(req.user_id, req.amount)
            .await?;
        if !check.allowed {
            debug!(
                user_id = %req.user_id,
                amount = %req.amount,
                limit_type = %check.limit_type,
                "Withdrawal limit exceeded"
            );
            return Err(WithdrawalError::LimitExceeded {
                limit_type: check.limit_type.to_string(),
                remaining_capacity: check.remaining_capacity,
                resets_at: check.resets_at,
            });
        }

        // 3. Allocation mode
        if !self.allocation.can_spend(req.user_id, req.amount).await? {
            if let Err(e) = self
                .allocation
                .log_declined_spending(req.user_id, req.amount, DECLINE_REASON)
                .await
            {
                warn!(user_id = %req.user_id, error = %e, "Failed to log declined spending");
            }
            if let Err(e) = self
                .notifier
                .notify_withdrawal_failed(req.user_id, req.amount, DECLINE_REASON)
                .await
            {
                warn!(user_id = %req.user_id, error = %e, "Failed to notify declined spending");
            }
            return Err(WithdrawalError::SpendingDeclined(DECLINE_REASON.to_string()));
        }

        // 4. Effective balance
        let account = self
            .ledger
            .get_account(&req.source_account_id)
            .await
            .map_err(ledger_error)?;
        if !account.is_active() {
            return Err(WithdrawalError::AccountNotActive(format!(
                "{} ({})",
                account.account_id, account.status
            )));
        }
        let available = account.buying_power - pending_total;
        if available < req.amount {
            return Err(WithdrawalError::InsufficientBalance {
                requested: req.amount,
                available,
                pending: pending_total,
            });
        }

        // 5. Persist
        let withdrawal = Withdrawal::new(WithdrawalId::new(), &req);
        self.repo.create(&withdrawal).await?;

        info!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            amount = %withdrawal.amount,
            destination_chain = %withdrawal.destination_chain,
            "Withdrawal accepted"
        );

        // 6. Best-effort bookkeeping
        if let Err(e) = self.limits.record_withdrawal(req.user_id, req.amount).await {
            warn!(withdrawal_id = %withdrawal.id, error = %e, "Failed to record limit usage");
        }
        if let Err(e) = self
            .audit
            .log_withdrawal(
                req.user_id,
                withdrawal.id,
                req.amount,
                WithdrawalStatus::Pending.as_str(),
            )
            .await
        {
            warn!(withdrawal_id = %withdrawal.id, error = %e, "Failed to write audit entry");
        }

        // 7. Queue the debit
        if let Err(e) = self
            .queue
            .enqueue(SagaMessage::new(withdrawal.id, SagaStep::Debit))
            .await
        {
            warn!(withdrawal_id = %withdrawal.id, error = %e, "Failed to enqueue debit step");
            let err = WithdrawalError::from(e);
            self.repo
                .mark_failed(withdrawal.id, &err.to_string())
                .await?;
            return Err(err);
        }

        Ok(InitiatedWithdrawal {
            withdrawal_id: withdrawal.id,
            status: withdrawal.status,
        })
    }

    /// Cancel before the ledger debit
    pub async fn cancel_withdrawal(
        &self,
        id: WithdrawalId,
        user_id: UserId,
    ) -> Result<Withdrawal, WithdrawalError> {
        let withdrawal = self.get_withdrawal(id, user_id).await?;

        let cancellable = withdrawal.status.can_transition_to(WithdrawalStatus::Cancelled)
            && !withdrawal.is_debited();
        if !cancellable || !self.repo.mark_cancelled(id).await? {
            let current = self
                .repo
                .get_by_id(id)
                .await?
                .map(|w| w.status)
                .unwrap_or(withdrawal.status);
            return Err(WithdrawalError::CannotCancel(current));
        }

        info!(withdrawal_id = %id, %user_id, "Withdrawal cancelled");
        if let Err(e) = self
            .audit
            .log_withdrawal(
                user_id,
                id,
                withdrawal.amount,
                WithdrawalStatus::Cancelled.as_str(),
            )
            .await
        {
            warn!(withdrawal_id = %id, error = %e, "Failed to write audit entry");
        }

        Ok(Withdrawal {
            status: WithdrawalStatus::Cancelled,
            ..withdrawal
        })
    }

    /// Fetch a withdrawal owned by `user_id`
    pub async fn get_withdrawal(
        &self,
        id: WithdrawalId,
        user_id: UserId,
    ) -> Result<Withdrawal, WithdrawalError> {
        let withdrawal = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or(WithdrawalError::NotFound(id))?;
        if withdrawal.user_id != user_id {
            return Err(WithdrawalError::Forbidden);
        }
        Ok(withdrawal)
    }

    /// Newest first; `limit` is capped at [`MAX_PAGE_SIZE`]
    pub async fn list_withdrawals(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Withdrawal>, WithdrawalError> {
        Ok(self
            .repo
            .get_by_user_id(user_id, limit.min(MAX_PAGE_SIZE), offset)
            .await?)
    }
}
