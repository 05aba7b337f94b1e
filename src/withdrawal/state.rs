//! Withdrawal Status Definitions
//!
//! Status IDs are stored in PostgreSQL as SMALLINT.
//! The transition table below is the single source of truth for legal moves;
//! every repository implementation guards its updates with it.

use std::fmt;
use std::str::FromStr;

/// Withdrawal saga status
///
/// Terminal: COMPLETED (40), FAILED (-10), CANCELLED (-30).
/// TIMEOUT (-20) is semi-terminal: only reconciliation moves it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum WithdrawalStatus {
    /// Accepted by intake, debit step queued
    Pending = 0,

    /// Worker owns the saga; ledger debit issued or about to be
    Processing = 10,

    /// Off-ramp transfer created, awaiting provider completion
    TransferInitiated = 20,

    /// Terminal: provider reported "completed"
    Completed = 40,

    /// Terminal: a step failed (see failure_reason)
    Failed = -10,

    /// No terminal result within the SLA window
    Timeout = -20,

    /// Terminal: cancelled before any ledger debit
    Cancelled = -30,
}

impl WithdrawalStatus {
    pub const ALL: [WithdrawalStatus; 7] = [
        WithdrawalStatus::Pending,
        WithdrawalStatus::Processing,
        WithdrawalStatus::TransferInitiated,
        WithdrawalStatus::Completed,
        WithdrawalStatus::Failed,
        WithdrawalStatus::Timeout,
        WithdrawalStatus::Cancelled,
    ];

    pub const TERMINAL: [WithdrawalStatus; 3] = [
        WithdrawalStatus::Completed,
        WithdrawalStatus::Failed,
        WithdrawalStatus::Cancelled,
    ];

    /// No further transitions possible
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Completed | WithdrawalStatus::Failed | WithdrawalStatus::Cancelled
        )
    }

    /// Counts toward the user's pending-withdrawals aggregate
    #[inline]
    pub fn is_pending_funds(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal successor states
    pub fn successors(&self) -> &'static [WithdrawalStatus] {
        use WithdrawalStatus::*;
        match self {
            Pending => &[Processing, Failed, Timeout, Cancelled],
            Processing => &[TransferInitiated, Failed, Timeout, Cancelled],
            TransferInitiated => &[Completed, Failed, Timeout],
            // Re-marking TIMEOUT refreshes the reason on each sweep
            Timeout => &[Completed, Failed, Timeout],
            Completed | Failed | Cancelled => &[],
        }
    }

    #[inline]
    pub fn can_transition_to(&self, next: WithdrawalStatus) -> bool {
        self.successors().contains(&next)
    }

    /// States from which `target` is reachable in one step
    pub fn predecessors(target: WithdrawalStatus) -> Vec<WithdrawalStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(WithdrawalStatus::Pending),
            10 => Some(WithdrawalStatus::Processing),
            20 => Some(WithdrawalStatus::TransferInitiated),
            40 => Some(WithdrawalStatus::Completed),
            -10 => Some(WithdrawalStatus::Failed),
            -20 => Some(WithdrawalStatus::Timeout),
            -30 => Some(WithdrawalStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Processing => "PROCESSING",
            WithdrawalStatus::TransferInitiated => "TRANSFER_INITIATED",
            WithdrawalStatus::Completed => "COMPLETED",
            WithdrawalStatus::Failed => "FAILED",
            WithdrawalStatus::Timeout => "TIMEOUT",
            WithdrawalStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown withdrawal status: {}", s))
    }
}

impl TryFrom<i16> for WithdrawalStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        WithdrawalStatus::from_id(value).ok_or(())
    }
}
