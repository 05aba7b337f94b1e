//! Off-ramp Saga - Brokerage-to-External Withdrawal Settlement
//!
//! Moves a user's funds out of a custodial brokerage balance and onto an
//! external rail without creating, losing or stranding money unnoticed.
//!
//! # Modules
//!
//! - [`circuit_breaker`] - Generic CLOSED/OPEN/HALF_OPEN breaker for external calls
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`withdrawal`] - Intake, saga orchestration, monitoring, reconciliation

pub mod circuit_breaker;
pub mod config;
pub mod logging;
pub mod withdrawal;

// Convenient re-exports at crate root
pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::AppConfig;
pub use withdrawal::{
    InitiatedWithdrawal, SagaOrchestrator, UserId, Withdrawal, WithdrawalError, WithdrawalId,
    WithdrawalIntake, WithdrawalRequest, WithdrawalStatus,
};
