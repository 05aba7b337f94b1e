//! Compensation
//!
//! Reverses a ledger debit by journaling the same amount from the system
//! account back to the source account. The reversal carries its own
//! idempotency reference, so a retried compensation books at most one
//! reversing journal.

use tracing::{error, info};

use super::adapters::{CASH_JOURNAL, JournalReceipt, JournalRequest, ProtectedLedger};
use super::error::{WithdrawalError, ledger_error};
use super::types::Withdrawal;

pub struct Compensator {
    ledger: ProtectedLedger,
    system_account_id: String,
}

impl Compensator {
    pub fn new(ledger: ProtectedLedger, system_account_id: impl Into<String>) -> Self {
        Self {
            ledger,
            system_account_id: system_account_id.into(),
        }
    }

    /// Idempotency reference of the reversing journal
    pub fn reversal_reference(withdrawal: &Withdrawal) -> String {
        format!("{}:reversal", withdrawal.id)
    }

    /// Book the reversing journal for a debited withdrawal.
    ///
    /// Refuses withdrawals without a debit journal: a reversal must always
    /// follow an original debit.
    pub async fn reverse_debit(
        &self,
        withdrawal: &Withdrawal,
    ) -> Result<JournalReceipt, WithdrawalError> {
        let Some(original) = withdrawal.ledger_journal_id.as_deref() else {
            return Err(WithdrawalError::CompensationFailed(format!(
                "withdrawal {} has no debit journal to reverse",
                withdrawal.id
            )));
        };

        let req = JournalRequest {
            from_account: self.system_account_id.clone(),
            to_account: withdrawal.source_account_id.clone(),
            entry_type: CASH_JOURNAL.to_string(),
            amount: withdrawal.amount,
            description: format!("Reversal of withdrawal {} (journal {})", withdrawal.id, original),
            reference: Self::reversal_reference(withdrawal),
        };

        match self.ledger.create_journal(&req).await {
            Ok(receipt) => {
                info!(
                    withdrawal_id = %withdrawal.id,
                    original_journal = original,
                    reversal_journal = %receipt.journal_id,
                    amount = %withdrawal.amount,
                    "Debit reversed"
                );
                Ok(receipt)
            }
            Err(e) => {
                error!(
                    alert = "STRANDED_FUNDS",
                    withdrawal_id = %withdrawal.id,
                    user_id = %withdrawal.user_id,
                    source_account = %withdrawal.source_account_id,
                    system_account = %self.system_account_id,
                    original_journal = original,
                    amount = %withdrawal.amount,
                    error = %e,
                    "CRITICAL: debit reversal failed, funds held in system account"
                );
                Err(WithdrawalError::CompensationFailed(
                    ledger_error(e).to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::withdrawal::adapters::mock::MockLedger;
    use crate::withdrawal::types::{UserId, WithdrawalId, WithdrawalRequest};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn setup() -> (Arc<MockLedger>, Compensator) {
        let ledger = Arc::new(MockLedger::new("SYS"));
        let breaker = Arc::new(CircuitBreaker::new("ledger", CircuitBreakerConfig::default()));
        let protected = ProtectedLedger::new(ledger.clone(), breaker);
        (ledger, Compensator::new(protected, "SYS"))
    }

    fn debited(journal: Option<&str>) -> Withdrawal {
        let mut w = Withdrawal::new(
            WithdrawalId::new(),
            &WithdrawalRequest {
                user_id: UserId::new_v4(),
                amount: Decimal::new(500, 0),
                destination_chain: "ethereum".into(),
                destination_address: "0xabc".into(),
                source_account_id: "acct-1".into(),
            },
        );
        w.ledger_journal_id = journal.map(str::to_string);
        w
    }

    #[tokio::test]
    async fn test_reversal_mirrors_debit() {
        let (ledger, comp) = setup();
        ledger.set_buying_power("SYS", Decimal::new(500, 0));
        let w = debited(Some("J1"));

        comp.reverse_debit(&w).await.unwrap();

        let journals = ledger.journals();
        assert_eq!(journals.len(), 1);
        let (_, req) = &journals[0];
        assert_eq!(req.from_account, "SYS");
        assert_eq!(req.to_account, "acct-1");
        assert_eq!(req.amount, w.amount);
        assert_eq!(ledger.buying_power("acct-1"), Decimal::new(500, 0));
    }

    #[tokio::test]
    async fn test_reversal_is_idempotent() {
        let (ledger, comp) = setup();
        let w = debited(Some("J1"));

        let a = comp.reverse_debit(&w).await.unwrap();
        let b = comp.reverse_debit(&w).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(ledger.journals().len(), 1);
    }

    #[tokio::test]
    async fn test_no_reversal_without_debit() {
        let (ledger, comp) = setup();
        let err = comp.reverse_debit(&debited(None)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::CompensationFailed(_)));
        assert_eq!(ledger.journal_calls(), 0);
    }

    #[tokio::test]
    async fn test_reversal_failure_surfaces() {
        let (ledger, comp) = setup();
        ledger.set_fail_reversal(true);
        let err = comp.reverse_debit(&debited(Some("J1"))).await.unwrap_err();
        assert_eq!(err.code(), "COMPENSATION_FAILED");
    }
}
