//! Intake Collaborators
//!
//! Limit and allocation guards, audit logging and user notifications are owned
//! by other subsystems. The saga only depends on the narrow traits below. The
//! default implementations are what the binary wires in when nothing richer is
//! configured.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::types::{UserId, WithdrawalId};
use crate::logging::AUDIT_TARGET;

#[derive(Debug, Error, Clone)]
pub enum GuardError {
    #[error("Limit service error: {0}")]
    Limits(String),

    #[error("Allocation service error: {0}")]
    Allocation(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Notification error: {0}")]
    Notification(String),
}

/// Which limit a check was decided by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    DailyAmount,
    DailyCount,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::DailyAmount => "DAILY_AMOUNT",
            LimitType::DailyCount => "DAILY_COUNT",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq)]
pub struct LimitCheck {
    pub allowed: bool,
    pub limit_type: LimitType,
    /// Amount (or count, for DAILY_COUNT) still available in the window
    pub remaining_capacity: Decimal,
    pub resets_at: DateTime<Utc>,
}

#[async_trait]
pub trait LimitsGuard: Send + Sync {
    async fn validate_withdrawal(
        &self,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<LimitCheck, GuardError>;

    async fn record_withdrawal(&self, user_id: UserId, amount: Decimal) -> Result<(), GuardError>;
}

#[async_trait]
pub trait AllocationGuard: Send + Sync {
    async fn can_spend(&self, user_id: UserId, amount: Decimal) -> Result<bool, GuardError>;

    async fn log_declined_spending(
        &self,
        user_id: UserId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GuardError>;
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log_withdrawal(
        &self,
        user_id: UserId,
        withdrawal_id: WithdrawalId,
        amount: Decimal,
        status: &str,
    ) -> Result<(), GuardError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_withdrawal_completed(
        &self,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<(), GuardError>;

    async fn notify_withdrawal_failed(
        &self,
        user_id: UserId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GuardError>;

    async fn notify_large_balance_change(
        &self,
        user_id: UserId,
        change_type: &str,
        amount: Decimal,
        new_balance: Option<Decimal>,
    ) -> Result<(), GuardError>;
}

// ============================================================================
// Tiered limits
// ============================================================================

/// One withdrawal-limit tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitTier {
    pub name: String,
    pub daily_amount: Decimal,
    pub daily_count: u32,
}

impl LimitTier {
    pub fn default_tiers() -> Vec<LimitTier> {
        vec![
            LimitTier {
                name: "standard".to_string(),
                daily_amount: Decimal::new(10_000, 0),
                daily_count: 5,
            },
            LimitTier {
                name: "verified".to_string(),
                daily_amount: Decimal::new(50_000, 0),
                daily_count: 20,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy)]
struct DailyUsage {
    day: NaiveDate,
    amount: Decimal,
    count: u32,
}

/// In-memory per-user daily limits, tier chosen per user
pub struct TieredLimitsGuard {
    tiers: Vec<LimitTier>,
    user_tiers: DashMap<UserId, String>,
    usage: DashMap<UserId, DailyUsage>,
}

impl TieredLimitsGuard {
    /// `tiers[0]` applies to users without an explicit assignment
    pub fn new(tiers: Vec<LimitTier>) -> Self {
        let tiers = if tiers.is_empty() {
            LimitTier::default_tiers()
        } else {
            tiers
        };
        Self {
            tiers,
            user_tiers: DashMap::new(),
            usage: DashMap::new(),
        }
    }

    pub fn assign_tier(&self, user_id: UserId, tier: &str) {
        self.user_tiers.insert(user_id, tier.to_string());
    }

    fn tier_for(&self, user_id: &UserId) -> &LimitTier {
        let assigned = self.user_tiers.get(user_id).map(|t| t.value().clone());
        assigned
            .and_then(|name| self.tiers.iter().find(|t| t.name == name))
            .unwrap_or(&self.tiers[0])
    }

    fn usage_today(&self, user_id: &UserId, today: NaiveDate) -> (Decimal, u32) {
        match self.usage.get(user_id) {
            Some(u) if u.day == today => (u.amount, u.count),
            _ => (Decimal::ZERO, 0),
        }
    }

    fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(now)
    }
}

#[async_trait]
impl LimitsGuard for TieredLimitsGuard {
    async fn validate_withdrawal(
        &self,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<LimitCheck, GuardError> {
        let now = Utc::now();
        let tier = self.tier_for(&user_id);
        let (used_amount, used_count) = self.usage_today(&user_id, now.date_naive());
        let resets_at = Self::next_reset(now);

        if used_count >= tier.daily_count {
            return Ok(LimitCheck {
                allowed: false,
                limit_type: LimitType::DailyCount,
                remaining_capacity: Decimal::ZERO,
                resets_at,
            });
        }

        let remaining = (tier.daily_amount - used_amount).max(Decimal::ZERO);
        Ok(LimitCheck {
            allowed: amount <= remaining,
            limit_type: LimitType::DailyAmount,
            remaining_capacity: remaining,
            resets_at,
        })
    }

    async fn record_withdrawal(&self, user_id: UserId, amount: Decimal) -> Result<(), GuardError> {
        let today = Utc::now().date_naive();
        let mut entry = self.usage.entry(user_id).or_insert(DailyUsage {
            day: today,
            amount: Decimal::ZERO,
            count: 0,
        });
        if entry.day != today {
            *entry = DailyUsage {
                day: today,
                amount: Decimal::ZERO,
                count: 0,
            };
        }
        entry.amount += amount;
        entry.count += 1;
        Ok(())
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// Allocation guard for deployments without spending modes
pub struct UnrestrictedAllocation;

#[async_trait]
impl AllocationGuard for UnrestrictedAllocation {
    async fn can_spend(&self, _user_id: UserId, _amount: Decimal) -> Result<bool, GuardError> {
        Ok(true)
    }

    async fn log_declined_spending(
        &self,
        user_id: UserId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GuardError> {
        info!(%user_id, %amount, reason, "Declined spending");
        Ok(())
    }
}

/// Audit trail written to the structured log
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log_withdrawal(
        &self,
        user_id: UserId,
        withdrawal_id: WithdrawalId,
        amount: Decimal,
        status: &str,
    ) -> Result<(), GuardError> {
        info!(
            target: AUDIT_TARGET,
            %user_id,
            %withdrawal_id,
            %amount,
            status,
            "withdrawal"
        );
        Ok(())
    }
}

/// Notifications written to the structured log
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_withdrawal_completed(
        &self,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<(), GuardError> {
        info!(%user_id, %amount, "notify: withdrawal completed");
        Ok(())
    }

    async fn notify_withdrawal_failed(
        &self,
        user_id: UserId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GuardError> {
        info!(%user_id, %amount, reason, "notify: withdrawal failed");
        Ok(())
    }

    async fn notify_large_balance_change(
        &self,
        user_id: UserId,
        change_type: &str,
        amount: Decimal,
        new_balance: Option<Decimal>,
    ) -> Result<(), GuardError> {
        info!(
            %user_id,
            change_type,
            %amount,
            new_balance = ?new_balance,
            "notify: large balance change"
        );
        Ok(())
    }
}

/// Recording fakes for tests
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Notification {
        Completed(UserId, Decimal),
        Failed(UserId, Decimal, String),
        LargeChange(UserId, String, Decimal, Option<Decimal>),
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_withdrawal_completed(
            &self,
            user_id: UserId,
            amount: Decimal,
        ) -> Result<(), GuardError> {
            self.sent
                .lock()
                .unwrap()
                .push(Notification::Completed(user_id, amount));
            Ok(())
        }

        async fn notify_withdrawal_failed(
            &self,
            user_id: UserId,
            amount: Decimal,
            reason: &str,
        ) -> Result<(), GuardError> {
            self.sent
                .lock()
                .unwrap()
                .push(Notification::Failed(user_id, amount, reason.to_string()));
            Ok(())
        }

        async fn notify_large_balance_change(
            &self,
            user_id: UserId,
            change_type: &str,
            amount: Decimal,
            new_balance: Option<Decimal>,
        ) -> Result<(), GuardError> {
            self.sent.lock().unwrap().push(Notification::LargeChange(
                user_id,
                change_type.to_string(),
                amount,
                new_balance,
            ));
            Ok(())
        }
    }

    /// Allocation guard with a switchable decision
    #[derive(Default)]
    pub struct SwitchAllocation {
        pub decline: AtomicBool,
        pub declined: Mutex<Vec<(UserId, Decimal, String)>>,
    }

    impl SwitchAllocation {
        pub fn set_decline(&self, decline: bool) {
            self.decline.store(decline, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AllocationGuard for SwitchAllocation {
        async fn can_spend(&self, _user_id: UserId, _amount: Decimal) -> Result<bool, GuardError> {
            Ok(!self.decline.load(Ordering::SeqCst))
        }

        async fn log_declined_spending(
            &self,
            user_id: UserId,
            amount: Decimal,
            reason: &str,
        ) -> Result<(), GuardError> {
            self.declined
                .lock()
                .unwrap()
                .push((user_id, amount, reason.to_string()));
            Ok(())
        }
    }

    /// Audit logger that can be made to fail
    #[derive(Default)]
    pub struct RecordingAudit {
        pub entries: Mutex<Vec<(WithdrawalId, String)>>,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl AuditLogger for RecordingAudit {
        async fn log_withdrawal(
            &self,
            _user_id: UserId,
            withdrawal_id: WithdrawalId,
            _amount: Decimal,
            status: &str,
        ) -> Result<(), GuardError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GuardError::Audit("audit store down".to_string()));
            }
            self.entries
                .lock()
                .unwrap()
                .push((withdrawal_id, status.to_string()));
            Ok(())
        }
    }
}
