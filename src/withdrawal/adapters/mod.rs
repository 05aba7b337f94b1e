//! External Adapters
//!
//! Ledger (brokerage) and transfer (off-ramp) capabilities used by the saga.
//! Every call the saga makes goes through [`ProtectedLedger`] /
//! [`ProtectedTransfer`], which route it through the dependency's shared
//! circuit breaker.
//!
//! Implementations should be idempotent on the `reference` they receive:
//! the saga passes the withdrawal ID so a redelivered step cannot double-debit
//! or double-send.

pub mod ledger;
pub mod offramp;

pub use ledger::BrokerLedgerClient;
pub use offramp::OfframpClient;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::UserId;
use crate::circuit_breaker::{BreakerError, CircuitBreaker};

/// Cash journal entry type
pub const CASH_JOURNAL: &str = "JNLC";

/// Adapter call failure
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AdapterError::Decode(e.to_string())
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

/// Ledger account snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub account_id: String,
    pub status: String,
    pub buying_power: Decimal,
}

impl LedgerAccount {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("ACTIVE")
    }
}

/// Journal between two ledger accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRequest {
    pub from_account: String,
    pub to_account: String,
    pub entry_type: String,
    pub amount: Decimal,
    pub description: String,
    /// Idempotency reference
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalReceipt {
    pub journal_id: String,
}

/// Off-ramp transfer instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub user_id: UserId,
    pub source_account_id: String,
    pub amount: Decimal,
    pub destination_chain: String,
    pub destination_address: String,
    /// Idempotency reference
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub recipient_id: String,
    pub status: TransferStatus,
}

/// Provider-reported transfer status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Failed(Option<String>),
    /// Any other provider value ("processing", "pending", ...)
    InProgress(String),
}

impl TransferStatus {
    /// Map a provider status string (and optional failure detail)
    pub fn from_provider(status: &str, reason: Option<String>) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "completed" => TransferStatus::Completed,
            "failed" => TransferStatus::Failed(reason),
            other => TransferStatus::InProgress(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::InProgress(_))
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed(_) => write!(f, "failed"),
            TransferStatus::InProgress(s) => write!(f, "{}", s),
        }
    }
}

/// Brokerage ledger
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    async fn get_account(&self, account_id: &str) -> Result<LedgerAccount, AdapterError>;

    async fn create_journal(&self, req: &JournalRequest) -> Result<JournalReceipt, AdapterError>;
}

/// Off-ramp transfer provider
#[async_trait]
pub trait TransferAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process_withdrawal(
        &self,
        req: &TransferInstruction,
    ) -> Result<TransferReceipt, AdapterError>;

    async fn get_transfer_status(&self, transfer_id: &str) -> Result<TransferStatus, AdapterError>;
}

/// Ledger adapter behind its circuit breaker
#[derive(Clone)]
pub struct ProtectedLedger {
    adapter: Arc<dyn LedgerAdapter>,
    breaker: Arc<CircuitBreaker>,
}

impl ProtectedLedger {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { adapter, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn get_account(
        &self,
        account_id: &str,
    ) -> Result<LedgerAccount, BreakerError<AdapterError>> {
        self.breaker
            .execute(|| self.adapter.get_account(account_id))
            .await
    }

    pub async fn create_journal(
        &self,
        req: &JournalRequest,
    ) -> Result<JournalReceipt, BreakerError<AdapterError>> {
        self.breaker.execute(|| self.adapter.create_journal(req)).await
    }
}

/// Transfer adapter behind its circuit breaker
#[derive(Clone)]
pub struct ProtectedTransfer {
    adapter: Arc<dyn TransferAdapter>,
    breaker: Arc<CircuitBreaker>,
}

impl ProtectedTransfer {
    pub fn new(adapter: Arc<dyn TransferAdapter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { adapter, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn process_withdrawal(
        &self,
        req: &TransferInstruction,
    ) -> Result<TransferReceipt, BreakerError<AdapterError>> {
        self.breaker
            .execute(|| self.adapter.process_withdrawal(req))
            .await
    }

    pub async fn get_transfer_status(
        &self,
        transfer_id: &str,
    ) -> Result<TransferStatus, BreakerError<AdapterError>> {
        self.breaker
            .execute(|| self.adapter.get_transfer_status(transfer_id))
            .await
    }
}

/// In-process fakes for tests and local runs
#[cfg(any(test, feature = "mock-adapters"))]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fake brokerage ledger keeping buying power per account
    pub struct MockLedger {
        accounts: Mutex<HashMap<String, Decimal>>,
        journals: Mutex<Vec<(JournalReceipt, JournalRequest)>>,
        by_reference: Mutex<HashMap<String, JournalReceipt>>,
        next_journal: AtomicUsize,
        journal_calls: AtomicUsize,
        fail_journal: AtomicBool,
        fail_reversal: AtomicBool,
        fail_get_account: AtomicBool,
        system_account: String,
    }

    impl MockLedger {
        pub fn new(system_account: impl Into<String>) -> Self {
            Self {
                accounts: Mutex::new(HashMap::new()),
                journals: Mutex::new(Vec::new()),
                by_reference: Mutex::new(HashMap::new()),
                next_journal: AtomicUsize::new(1),
                journal_calls: AtomicUsize::new(0),
                fail_journal: AtomicBool::new(false),
                fail_reversal: AtomicBool::new(false),
                fail_get_account: AtomicBool::new(false),
                system_account: system_account.into(),
            }
        }

        pub fn set_buying_power(&self, account_id: &str, amount: Decimal) {
            self.accounts
                .lock()
                .unwrap()
                .insert(account_id.to_string(), amount);
        }

        pub fn buying_power(&self, account_id: &str) -> Decimal {
            self.accounts
                .lock()
                .unwrap()
                .get(account_id)
                .copied()
                .unwrap_or(Decimal::ZERO)
        }

        /// Fail debits (journals out of a user account)
        pub fn set_fail_journal(&self, fail: bool) {
            self.fail_journal.store(fail, Ordering::SeqCst);
        }

        /// Fail reversals (journals out of the system account)
        pub fn set_fail_reversal(&self, fail: bool) {
            self.fail_reversal.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_get_account(&self, fail: bool) {
            self.fail_get_account.store(fail, Ordering::SeqCst);
        }

        /// Journals booked so far, in order
        pub fn journals(&self) -> Vec<(JournalReceipt, JournalRequest)> {
            self.journals.lock().unwrap().clone()
        }

        /// Calls to create_journal, including failed and deduplicated ones
        pub fn journal_calls(&self) -> usize {
            self.journal_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LedgerAdapter for MockLedger {
        fn name(&self) -> &'static str {
            "mock-ledger"
        }

        async fn get_account(&self, account_id: &str) -> Result<LedgerAccount, AdapterError> {
            if self.fail_get_account.load(Ordering::SeqCst) {
                return Err(AdapterError::Network("mock ledger unreachable".to_string()));
            }
            let accounts = self.accounts.lock().unwrap();
            let buying_power = accounts
                .get(account_id)
                .copied()
                .ok_or_else(|| AdapterError::Api {
                    status: 404,
                    message: format!("account {} not found", account_id),
                })?;
            Ok(LedgerAccount {
                account_id: account_id.to_string(),
                status: "ACTIVE".to_string(),
                buying_power,
            })
        }

        async fn create_journal(
            &self,
            req: &JournalRequest,
        ) -> Result<JournalReceipt, AdapterError> {
            self.journal_calls.fetch_add(1, Ordering::SeqCst);

            let reversal = req.from_account == self.system_account;
            if reversal && self.fail_reversal.load(Ordering::SeqCst) {
                return Err(AdapterError::Network("mock reversal failure".to_string()));
            }
            if !reversal && self.fail_journal.load(Ordering::SeqCst) {
                return Err(AdapterError::Api {
                    status: 422,
                    message: "mock journal failure".to_string(),
                });
            }

            if let Some(existing) = self.by_reference.lock().unwrap().get(&req.reference) {
                return Ok(existing.clone());
            }

            {
                let mut accounts = self.accounts.lock().unwrap();
                *accounts.entry(req.from_account.clone()).or_default() -= req.amount;
                *accounts.entry(req.to_account.clone()).or_default() += req.amount;
            }

            let receipt = JournalReceipt {
                journal_id: format!("J{}", self.next_journal.fetch_add(1, Ordering::SeqCst)),
            };
            self.by_reference
                .lock()
                .unwrap()
                .insert(req.reference.clone(), receipt.clone());
            self.journals
                .lock()
                .unwrap()
                .push((receipt.clone(), req.clone()));
            Ok(receipt)
        }
    }

    /// Fake off-ramp provider with a scripted status sequence
    pub struct MockOfframp {
        fail_initiate: AtomicBool,
        status_unreachable: AtomicBool,
        /// Consumed front-to-back; the last entry repeats
        script: Mutex<VecDeque<TransferStatus>>,
        initiated: Mutex<Vec<TransferInstruction>>,
        next_transfer: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl Default for MockOfframp {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockOfframp {
        pub fn new() -> Self {
            Self {
                fail_initiate: AtomicBool::new(false),
                status_unreachable: AtomicBool::new(false),
                script: Mutex::new(VecDeque::from([TransferStatus::Completed])),
                initiated: Mutex::new(Vec::new()),
                next_transfer: AtomicUsize::new(1),
                status_calls: AtomicUsize::new(0),
            }
        }

        pub fn set_fail_initiate(&self, fail: bool) {
            self.fail_initiate.store(fail, Ordering::SeqCst);
        }

        pub fn set_status_unreachable(&self, unreachable: bool) {
            self.status_unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Replace the status sequence returned by get_transfer_status
        pub fn set_status_script(&self, statuses: Vec<TransferStatus>) {
            *self.script.lock().unwrap() = statuses.into();
        }

        pub fn initiated(&self) -> Vec<TransferInstruction> {
            self.initiated.lock().unwrap().clone()
        }

        pub fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransferAdapter for MockOfframp {
        fn name(&self) -> &'static str {
            "mock-offramp"
        }

        async fn process_withdrawal(
            &self,
            req: &TransferInstruction,
        ) -> Result<TransferReceipt, AdapterError> {
            if self.fail_initiate.load(Ordering::SeqCst) {
                return Err(AdapterError::Api {
                    status: 400,
                    message: "mock destination rejected".to_string(),
                });
            }
            self.initiated.lock().unwrap().push(req.clone());
            let n = self.next_transfer.fetch_add(1, Ordering::SeqCst);
            Ok(TransferReceipt {
                transfer_id: format!("tr_{}", n),
                recipient_id: format!("rcp_{}", n),
                status: TransferStatus::InProgress("pending".to_string()),
            })
        }

        async fn get_transfer_status(
            &self,
            _transfer_id: &str,
        ) -> Result<TransferStatus, AdapterError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if self.status_unreachable.load(Ordering::SeqCst) {
                return Err(AdapterError::Network("mock offramp unreachable".to_string()));
            }
            let mut script = self.script.lock().unwrap();
            let status = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            Ok(status.unwrap_or(TransferStatus::InProgress("processing".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockLedger, MockOfframp};
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    #[test]
    fn test_transfer_status_from_provider() {
        assert_eq!(
            TransferStatus::from_provider("COMPLETED", None),
            TransferStatus::Completed
        );
        assert_eq!(
            TransferStatus::from_provider("failed", Some("bad iban".into())),
            TransferStatus::Failed(Some("bad iban".into()))
        );
        let s = TransferStatus::from_provider("processing", None);
        assert_eq!(s, TransferStatus::InProgress("processing".into()));
        assert!(!s.is_terminal());
        assert_eq!(s.to_string(), "processing");
    }

    #[tokio::test]
    async fn test_mock_ledger_journal_is_idempotent_on_reference() {
        let ledger = MockLedger::new("SYS");
        ledger.set_buying_power("acct-1", Decimal::new(1000, 0));

        let req = JournalRequest {
            from_account: "acct-1".into(),
            to_account: "SYS".into(),
            entry_type: CASH_JOURNAL.into(),
            amount: Decimal::new(250, 0),
            description: "test".into(),
            reference: "w-1".into(),
        };
        let first = ledger.create_journal(&req).await.unwrap();
        let second = ledger.create_journal(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.journals().len(), 1);
        assert_eq!(ledger.journal_calls(), 2);
        assert_eq!(ledger.buying_power("acct-1"), Decimal::new(750, 0));
        assert_eq!(ledger.buying_power("SYS"), Decimal::new(250, 0));
    }

    #[tokio::test]
    async fn test_mock_offramp_script_repeats_last() {
        let offramp = MockOfframp::new();
        offramp.set_status_script(vec![
            TransferStatus::InProgress("processing".into()),
            TransferStatus::Completed,
        ]);
        assert!(!offramp.get_transfer_status("t").await.unwrap().is_terminal());
        assert_eq!(
            offramp.get_transfer_status("t").await.unwrap(),
            TransferStatus::Completed
        );
        assert_eq!(
            offramp.get_transfer_status("t").await.unwrap(),
            TransferStatus::Completed
        );
        assert_eq!(offramp.status_calls(), 3);
    }

    #[tokio::test]
    async fn test_protected_ledger_trips_breaker() {
        let ledger = Arc::new(MockLedger::new("SYS"));
        ledger.set_fail_get_account(true);
        let breaker = Arc::new(CircuitBreaker::new(
            "ledger",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        ));
        let protected = ProtectedLedger::new(ledger, breaker.clone());

        assert!(matches!(
            protected.get_account("acct-1").await,
            Err(BreakerError::Inner(AdapterError::Network(_)))
        ));
        protected.get_account("acct-1").await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            protected.get_account("acct-1").await,
            Err(BreakerError::Open(_))
        ));
    }
}
