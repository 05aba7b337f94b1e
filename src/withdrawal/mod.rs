//! Off-ramp Withdrawal Saga
//!
//! Moves funds from a custodial brokerage balance to an external destination
//! by coordinating two independently failing systems:
//! - **Brokerage Ledger** (journals between user and system accounts)
//! - **Off-ramp Provider** (asynchronous payout to chain/rail)
//!
//! # State Machine
//!
//! ```text
//! PENDING → PROCESSING ──debit──→ (journal set) ──transfer──→ TRANSFER_INITIATED → COMPLETED
//!    │          │                      │                          │        │
//!    │          └→ FAILED              └→ FAILED (reversed)       FAILED   TIMEOUT → COMPLETED | FAILED
//!    └──────────┴→ CANCELLED (before debit only)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Check-Before-Call**: Every step re-reads the record; a recorded journal
//!    or transfer ID means the external call is never repeated
//! 2. **Reference Idempotency**: External calls carry the withdrawal ID
//! 3. **Compensate Only After Debit**: A reversal journal always follows a debit
//! 4. **No Silent Strand**: A failed reversal is logged with
//!    `alert = "STRANDED_FUNDS"` and left FAILED for manual reconciliation
//! 5. **TIMEOUT Is Semi-Terminal**: Only the reconciliation sweep moves it on

pub mod adapters;
pub mod compensation;
pub mod context;
pub mod db;
pub mod error;
pub mod guards;
pub mod intake;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod reconciliation;
pub mod repository;
pub mod state;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use context::SagaContext;
pub use db::PgWithdrawalRepository;
pub use error::WithdrawalError;
pub use intake::WithdrawalIntake;
pub use monitor::{CompletionMonitor, MonitorConfig};
pub use orchestrator::SagaOrchestrator;
pub use queue::{ChannelQueue, SagaMessage, SagaQueue, SagaReceiver, SagaStep, saga_channel};
pub use reconciliation::{ReconciliationConfig, ReconciliationReport, ReconciliationSweep};
pub use repository::{InMemoryWithdrawalRepository, WithdrawalRepository};
pub use state::WithdrawalStatus;
pub use types::{InitiatedWithdrawal, UserId, Withdrawal, WithdrawalId, WithdrawalRequest};
pub use worker::{SagaWorkerPool, WorkerConfig};
