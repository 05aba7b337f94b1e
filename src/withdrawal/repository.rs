//! Withdrawal Repository
//!
//! Every mutating operation is a compare-and-swap against the status
//! transition table: it succeeds (returns `true`) only if the stored record is
//! in a state from which the requested move is legal, and only if the linkage
//! preconditions hold. A `false` return means another worker got there first
//! or the move is illegal; callers re-read the record and decide.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;

use super::state::WithdrawalStatus;
use super::types::{UserId, Withdrawal, WithdrawalId};

#[derive(Debug, Error, Clone)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Duplicate withdrawal id: {0}")]
    Duplicate(WithdrawalId),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

#[async_trait]
pub trait WithdrawalRepository: Send + Sync {
    async fn create(&self, withdrawal: &Withdrawal) -> Result<(), RepositoryError>;

    async fn get_by_id(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, RepositoryError>;

    /// Newest first
    async fn get_by_user_id(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError>;

    /// CAS: `from → to`, legal per the transition table
    async fn update_status(
        &self,
        id: WithdrawalId,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
    ) -> Result<bool, RepositoryError>;

    /// Record the debit journal. Requires PROCESSING and no journal yet.
    async fn update_ledger_journal(
        &self,
        id: WithdrawalId,
        journal_id: &str,
    ) -> Result<bool, RepositoryError>;

    /// Record the transfer and move to TRANSFER_INITIATED.
    /// Requires PROCESSING, a journal, and no transfer yet.
    async fn update_transfer_details(
        &self,
        id: WithdrawalId,
        transfer_id: &str,
        recipient_id: &str,
    ) -> Result<bool, RepositoryError>;

    /// Requires both journal and transfer IDs
    async fn mark_completed(&self, id: WithdrawalId) -> Result<bool, RepositoryError>;

    async fn mark_failed(&self, id: WithdrawalId, reason: &str) -> Result<bool, RepositoryError>;

    async fn mark_timeout(&self, id: WithdrawalId, reason: &str) -> Result<bool, RepositoryError>;

    /// Requires no journal yet
    async fn mark_cancelled(&self, id: WithdrawalId) -> Result<bool, RepositoryError>;

    /// Sum of non-terminal withdrawal amounts for the user
    async fn get_pending_withdrawals_total(
        &self,
        user_id: UserId,
    ) -> Result<Decimal, RepositoryError>;

    /// Non-terminal withdrawals created more than `sla_threshold` ago, least
    /// recently updated first. TIMEOUT records without a transfer are left out:
    /// there is nothing to enquire about.
    async fn get_stuck_withdrawals(
        &self,
        sla_threshold: Duration,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError>;

    /// PENDING / PROCESSING withdrawals younger than `max_age` and untouched
    /// for at least `idle`, least recently updated first
    async fn get_stalled_withdrawals(
        &self,
        idle: Duration,
        max_age: Duration,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError>;
}

fn ago(d: Duration) -> Result<chrono::DateTime<Utc>, RepositoryError> {
    let d = chrono::Duration::from_std(d)
        .map_err(|e| RepositoryError::Database(format!("invalid duration: {}", e)))?;
    Ok(Utc::now() - d)
}

/// Parked without a transfer: nothing left for the sweep to enquire
#[inline]
pub fn is_parked_without_transfer(w: &Withdrawal) -> bool {
    w.status == WithdrawalStatus::Timeout && w.transfer_id.is_none()
}

/// DashMap-backed repository for local runs and tests
#[derive(Default)]
pub struct InMemoryWithdrawalRepository {
    records: DashMap<WithdrawalId, Withdrawal>,
}

impl InMemoryWithdrawalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply `mutate` if the record can move to `to` and `guard` accepts it
    fn transition<G, M>(&self, id: WithdrawalId, to: WithdrawalStatus, guard: G, mutate: M) -> bool
    where
        G: FnOnce(&Withdrawal) -> bool,
        M: FnOnce(&mut Withdrawal),
    {
        let Some(mut record) = self.records.get_mut(&id) else {
            return false;
        };
        if !record.status.can_transition_to(to) || !guard(&record) {
            return false;
        }
        mutate(&mut record);
        record.status = to;
        record.updated_at = Utc::now();
        true
    }

    /// Shift a record's timestamps into the past
    #[cfg(test)]
    pub fn backdate(&self, id: WithdrawalId, by: chrono::Duration) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.created_at -= by;
            record.updated_at -= by;
        }
    }
}

#[async_trait]
impl WithdrawalRepository for InMemoryWithdrawalRepository {
    async fn create(&self, withdrawal: &Withdrawal) -> Result<(), RepositoryError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(withdrawal.id) {
            Entry::Occupied(_) => Err(RepositoryError::Duplicate(withdrawal.id)),
            Entry::Vacant(slot) => {
                slot.insert(withdrawal.clone());
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, RepositoryError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn get_by_user_id(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError> {
        let mut rows: Vec<Withdrawal> = self
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_status(
        &self,
        id: WithdrawalId,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
    ) -> Result<bool, RepositoryError> {
        Ok(self.transition(id, to, |w| w.status == from, |_| {}))
    }

    async fn update_ledger_journal(
        &self,
        id: WithdrawalId,
        journal_id: &str,
    ) -> Result<bool, RepositoryError> {
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != WithdrawalStatus::Processing || record.ledger_journal_id.is_some() {
            return Ok(false);
        }
        record.ledger_journal_id = Some(journal_id.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_transfer_details(
        &self,
        id: WithdrawalId,
        transfer_id: &str,
        recipient_id: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self.transition(
            id,
            WithdrawalStatus::TransferInitiated,
            |w| {
                w.status == WithdrawalStatus::Processing
                    && w.ledger_journal_id.is_some()
                    && w.transfer_id.is_none()
            },
            |w| {
                w.transfer_id = Some(transfer_id.to_string());
                w.recipient_id = Some(recipient_id.to_string());
            },
        ))
    }

    async fn mark_completed(&self, id: WithdrawalId) -> Result<bool, RepositoryError> {
        Ok(self.transition(
            id,
            WithdrawalStatus::Completed,
            |w| w.ledger_journal_id.is_some() && w.transfer_id.is_some(),
            |w| w.failure_reason = None,
        ))
    }

    async fn mark_failed(&self, id: WithdrawalId, reason: &str) -> Result<bool, RepositoryError> {
        Ok(self.transition(
            id,
            WithdrawalStatus::Failed,
            |_| true,
            |w| w.failure_reason = Some(reason.to_string()),
        ))
    }

    async fn mark_timeout(&self, id: WithdrawalId, reason: &str) -> Result<bool, RepositoryError> {
        Ok(self.transition(
            id,
            WithdrawalStatus::Timeout,
            |_| true,
            |w| w.failure_reason = Some(reason.to_string()),
        ))
    }

    async fn mark_cancelled(&self, id: WithdrawalId) -> Result<bool, RepositoryError> {
        Ok(self.transition(
            id,
            WithdrawalStatus::Cancelled,
            |w| w.ledger_journal_id.is_none(),
            |_| {},
        ))
    }

    async fn get_pending_withdrawals_total(
        &self,
        user_id: UserId,
    ) -> Result<Decimal, RepositoryError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.status.is_pending_funds())
            .map(|r| r.amount)
            .sum())
    }

    async fn get_stuck_withdrawals(
        &self,
        sla_threshold: Duration,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError> {
        let cutoff = ago(sla_threshold)?;

        let mut rows: Vec<Withdrawal> = self
            .records
            .iter()
            .filter(|r| {
                !r.status.is_terminal() && !is_parked_without_transfer(r) && r.created_at < cutoff
            })
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|w| (w.updated_at, w.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_stalled_withdrawals(
        &self,
        idle: Duration,
        max_age: Duration,
        limit: usize,
    ) -> Result<Vec<Withdrawal>, RepositoryError> {
        let idle_cutoff = ago(idle)?;
        let age_cutoff = ago(max_age)?;

        let mut rows: Vec<Withdrawal> = self
            .records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    WithdrawalStatus::Pending | WithdrawalStatus::Processing
                ) && r.updated_at <= idle_cutoff
                    && r.created_at >= age_cutoff
            })
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|w| w.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::withdrawal::types::WithdrawalRequest;

    fn new_withdrawal(user_id: UserId, amount: i64) -> Withdrawal {
        Withdrawal::new(
            WithdrawalId::new(),
            &WithdrawalRequest {
                user_id,
                amount: Decimal::new(amount, 0),
                destination_chain: "ethereum".into(),
                destination_address: "0xabc".into(),
                source_account_id: "acct-1".into(),
            },
        )
    }

    async fn seeded() -> (InMemoryWithdrawalRepository, Withdrawal) {
        let repo = InMemoryWithdrawalRepository::new();
        let w = new_withdrawal(UserId::new_v4(), 100);
        repo.create(&w).await.unwrap();
        (repo, w)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let (repo, w) = seeded().await;
        assert!(matches!(
            repo.create(&w).await,
            Err(RepositoryError::Duplicate(_))
        ));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_is_cas() {
        let (repo, w) = seeded().await;
        use WithdrawalStatus::*;

        assert!(repo.update_status(w.id, Pending, Processing).await.unwrap());
        // Second worker loses the race
        assert!(!repo.update_status(w.id, Pending, Processing).await.unwrap());
        // Illegal per table
        assert!(!repo.update_status(w.id, Processing, Completed).await.unwrap());

        let stored = repo.get_by_id(w.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Processing);
    }

    #[tokio::test]
    async fn test_journal_set_once() {
        let (repo, w) = seeded().await;
        assert!(!repo.update_ledger_journal(w.id, "J1").await.unwrap());

        repo.update_status(w.id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
            .await
            .unwrap();
        assert!(repo.update_ledger_journal(w.id, "J1").await.unwrap());
        assert!(!repo.update_ledger_journal(w.id, "J2").await.unwrap());

        let stored = repo.get_by_id(w.id).await.unwrap().unwrap();
        assert_eq!(stored.ledger_journal_id.as_deref(), Some("J1"));
    }

    #[tokio::test]
    async fn test_transfer_requires_journal() {
        let (repo, w) = seeded().await;
        repo.update_status(w.id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
            .await
            .unwrap();

        assert!(!repo.update_transfer_details(w.id, "tr", "rcp").await.unwrap());

        repo.update_ledger_journal(w.id, "J1").await.unwrap();
        assert!(repo.update_transfer_details(w.id, "tr", "rcp").await.unwrap());

        let stored = repo.get_by_id(w.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::TransferInitiated);
        assert_eq!(stored.recipient_id.as_deref(), Some("rcp"));
        assert!(stored.links_consistent());
    }

    #[tokio::test]
    async fn test_completed_requires_links() {
        let (repo, w) = seeded().await;
        repo.mark_timeout(w.id, "stuck").await.unwrap();
        // TIMEOUT without a transfer can never complete
        assert!(!repo.mark_completed(w.id).await.unwrap());
        assert!(repo.mark_failed(w.id, "reconciled").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let (repo, w) = seeded().await;
        assert!(repo.mark_failed(w.id, "boom").await.unwrap());

        assert!(!repo.mark_timeout(w.id, "late").await.unwrap());
        assert!(!repo.mark_cancelled(w.id).await.unwrap());
        assert!(!repo.mark_failed(w.id, "again").await.unwrap());

        let stored = repo.get_by_id(w.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancel_refused_after_debit() {
        let (repo, w) = seeded().await;
        repo.update_status(w.id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
            .await
            .unwrap();
        repo.update_ledger_journal(w.id, "J1").await.unwrap();

        assert!(!repo.mark_cancelled(w.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_total_excludes_terminal() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let a = new_withdrawal(user, 100);
        let b = new_withdrawal(user, 250);
        let c = new_withdrawal(user, 400);
        let other = new_withdrawal(UserId::new_v4(), 999);
        for w in [&a, &b, &c, &other] {
            repo.create(w).await.unwrap();
        }
        repo.mark_failed(c.id, "x").await.unwrap();
        repo.mark_timeout(b.id, "stuck").await.unwrap();

        // TIMEOUT still holds funds
        assert_eq!(
            repo.get_pending_withdrawals_total(user).await.unwrap(),
            Decimal::new(350, 0)
        );
    }

    #[tokio::test]
    async fn test_stuck_query_honours_threshold_and_order() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let old = new_withdrawal(user, 1);
        let older = new_withdrawal(user, 2);
        let fresh = new_withdrawal(user, 3);
        let done = new_withdrawal(user, 4);
        for w in [&old, &older, &fresh, &done] {
            repo.create(w).await.unwrap();
        }
        repo.backdate(old.id, chrono::Duration::minutes(20));
        repo.backdate(older.id, chrono::Duration::minutes(40));
        repo.backdate(done.id, chrono::Duration::minutes(40));
        repo.mark_failed(done.id, "x").await.unwrap();

        let stuck = repo
            .get_stuck_withdrawals(Duration::from_secs(15 * 60), 10)
            .await
            .unwrap();
        let ids: Vec<_> = stuck.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![older.id, old.id]);
    }

    #[tokio::test]
    async fn test_stuck_query_skips_parked_without_transfer() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let parked = new_withdrawal(user, 1);
        let waiting = new_withdrawal(user, 2);
        repo.create(&parked).await.unwrap();
        repo.create(&waiting).await.unwrap();
        repo.mark_timeout(parked.id, "no transfer initiated within SLA")
            .await
            .unwrap();
        repo.backdate(parked.id, chrono::Duration::minutes(60));
        repo.backdate(waiting.id, chrono::Duration::minutes(20));

        let stuck = repo
            .get_stuck_withdrawals(Duration::from_secs(15 * 60), 1)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, waiting.id);
    }

    #[tokio::test]
    async fn test_stuck_query_rotates_by_last_update() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let first = new_withdrawal(user, 1);
        let second = new_withdrawal(user, 2);
        repo.create(&first).await.unwrap();
        repo.create(&second).await.unwrap();
        repo.backdate(first.id, chrono::Duration::minutes(40));
        repo.backdate(second.id, chrono::Duration::minutes(30));

        // Touching the oldest record sends it to the back of the batch
        repo.update_status(first.id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
            .await
            .unwrap();

        let stuck = repo
            .get_stuck_withdrawals(Duration::from_secs(15 * 60), 1)
            .await
            .unwrap();
        assert_eq!(stuck[0].id, second.id);
    }

    #[tokio::test]
    async fn test_stalled_query_window() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let idle = new_withdrawal(user, 1);
        let busy = new_withdrawal(user, 2);
        let expired = new_withdrawal(user, 3);
        let sent = new_withdrawal(user, 4);
        for w in [&idle, &busy, &expired, &sent] {
            repo.create(w).await.unwrap();
        }
        repo.update_status(sent.id, WithdrawalStatus::Pending, WithdrawalStatus::Processing)
            .await
            .unwrap();
        repo.update_ledger_journal(sent.id, "J1").await.unwrap();
        repo.update_transfer_details(sent.id, "tr", "rcp").await.unwrap();

        repo.backdate(idle.id, chrono::Duration::minutes(5));
        repo.backdate(expired.id, chrono::Duration::minutes(30));
        repo.backdate(sent.id, chrono::Duration::minutes(5));

        let stalled = repo
            .get_stalled_withdrawals(Duration::from_secs(60), Duration::from_secs(15 * 60), 10)
            .await
            .unwrap();
        let ids: Vec<_> = stalled.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![idle.id]);

        // Zero idle window picks up fresh records too
        let all = repo
            .get_stalled_withdrawals(Duration::ZERO, Duration::from_secs(15 * 60), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_get_by_user_paginates_newest_first() {
        let repo = InMemoryWithdrawalRepository::new();
        let user = UserId::new_v4();
        let mut ids = Vec::new();
        for i in 0..5 {
            let w = new_withdrawal(user, i + 1);
            ids.push(w.id);
            repo.create(&w).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let page = repo.get_by_user_id(user, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }
}
