//! Withdrawal Core Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::WithdrawalStatus;

/// Brokerage user identifier
pub type UserId = uuid::Uuid;

/// Withdrawal ID - ULID-based, sortable by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WithdrawalId(ulid::Ulid);

impl WithdrawalId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for WithdrawalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WithdrawalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WithdrawalId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Withdrawal request from the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: UserId,
    /// Exact amount in account currency
    pub amount: Decimal,
    /// Chain / rail identifier (e.g. "ethereum", "solana", "ach")
    pub destination_chain: String,
    pub destination_address: String,
    /// Brokerage ledger account funds are taken from
    pub source_account_id: String,
}

/// Synchronous intake result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatedWithdrawal {
    pub withdrawal_id: WithdrawalId,
    pub status: WithdrawalStatus,
}

/// Persisted withdrawal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user_id: UserId,
    pub source_account_id: String,
    pub amount: Decimal,
    pub destination_chain: String,
    pub destination_address: String,
    pub status: WithdrawalStatus,
    /// Set once by the debit step
    pub ledger_journal_id: Option<String>,
    /// Set once by the transfer step, together with `recipient_id`
    pub transfer_id: Option<String>,
    pub recipient_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    /// New record in PENDING
    pub fn new(id: WithdrawalId, req: &WithdrawalRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: req.user_id,
            source_account_id: req.source_account_id.clone(),
            amount: req.amount,
            destination_chain: req.destination_chain.clone(),
            destination_address: req.destination_address.clone(),
            status: WithdrawalStatus::Pending,
            ledger_journal_id: None,
            transfer_id: None,
            recipient_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Source account has been debited into the system account
    #[inline]
    pub fn is_debited(&self) -> bool {
        self.ledger_journal_id.is_some()
    }

    /// Linkage invariants: a transfer never exists without a debit, and
    /// COMPLETED carries both links
    pub fn links_consistent(&self) -> bool {
        let transfer_after_debit = self.transfer_id.is_none() || self.ledger_journal_id.is_some();
        let completed_linked = self.status != WithdrawalStatus::Completed
            || (self.transfer_id.is_some() && self.ledger_journal_id.is_some());
        transfer_after_debit && completed_linked
    }
}

impl fmt::Display for Withdrawal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Withdrawal[{}] user={} amount={} -> {}:{} status={}",
            self.id,
            self.user_id,
            self.amount,
            self.destination_chain,
            self.destination_address,
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WithdrawalRequest {
        WithdrawalRequest {
            user_id: uuid::Uuid::new_v4(),
            amount: Decimal::new(12550, 2),
            destination_chain: "ethereum".to_string(),
            destination_address: "0xabc".to_string(),
            source_account_id: "acct-1".to_string(),
        }
    }

    #[test]
    fn test_withdrawal_new_is_pending_and_unlinked() {
        let id = WithdrawalId::new();
        let w = Withdrawal::new(id, &request());

        assert_eq!(w.id, id);
        assert_eq!(w.status, WithdrawalStatus::Pending);
        assert_eq!(w.amount, Decimal::new(12550, 2));
        assert!(!w.is_debited());
        assert!(w.transfer_id.is_none());
        assert!(w.failure_reason.is_none());
        assert!(w.links_consistent());
    }

    #[test]
    fn test_links_consistent_rejects_transfer_without_debit() {
        let mut w = Withdrawal::new(WithdrawalId::new(), &request());
        w.transfer_id = Some("tr-1".to_string());
        assert!(!w.links_consistent());

        w.ledger_journal_id = Some("j-1".to_string());
        assert!(w.links_consistent());
    }

    #[test]
    fn test_completed_requires_both_links() {
        let mut w = Withdrawal::new(WithdrawalId::new(), &request());
        w.status = WithdrawalStatus::Completed;
        assert!(!w.links_consistent());
    }

    #[test]
    fn test_withdrawal_id_parse_roundtrip() {
        let id = WithdrawalId::new();
        let parsed: WithdrawalId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<WithdrawalId>().is_err());
    }
}
