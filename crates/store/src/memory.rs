use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use engage_contracts::IdentityToken;

use crate::{
    AppliedVote, EngagementStore, LoginAttemptRecord, LoginPolicy, RatingAggregate, StoreError,
    VoteRecord, VoteWrite,
};

type LoginCell = Arc<tokio::sync::Mutex<Option<LoginAttemptRecord>>>;

/// Process-local store with one async lock per subject and per login
/// identifier. The registry maps are only locked long enough to fetch a cell.
#[derive(Clone, Default)]
pub struct MemoryStore {
    subjects: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<SubjectCell>>>>>,
    logins: Arc<Mutex<LoginRegistry>>,
}

/// Login cells plus the earliest time the next expiry sweep may run. Sweeping
/// at most once per lockout interval keeps the cost amortized per failure.
#[derive(Default)]
struct LoginRegistry {
    cells: HashMap<IdentityToken, LoginCell>,
    next_sweep_at_epoch_ms: i64,
}

#[derive(Debug)]
struct SubjectCell {
    deleted: bool,
    view_count: i64,
    aggregate: RatingAggregate,
    votes: HashMap<IdentityToken, VoteRecord>,
}

fn lock_registry<T>(registry: &Mutex<T>) -> MutexGuard<'_, T> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn subject_cell(
        &self,
        subject_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<SubjectCell>>, StoreError> {
        lock_registry(&self.subjects)
            .get(subject_id)
            .cloned()
            .ok_or_else(|| StoreError::SubjectNotFound(subject_id.to_string()))
    }

    fn login_cell(&self, identifier: &IdentityToken) -> LoginCell {
        lock_registry(&self.logins)
            .cells
            .entry(identifier.clone())
            .or_default()
            .clone()
    }

    /// Drops login cells whose window has passed. Cells held by an in-flight
    /// call are left for a later sweep.
    fn prune_expired_logins(&self, policy: &LoginPolicy, now_epoch_ms: i64) -> usize {
        let mut logins = lock_registry(&self.logins);
        if now_epoch_ms < logins.next_sweep_at_epoch_ms {
            return 0;
        }
        logins.next_sweep_at_epoch_ms = now_epoch_ms.saturating_add(policy.lockout_ms().max(1));

        let before = logins.cells.len();
        logins.cells.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            match cell.try_lock() {
                Ok(slot) => slot
                    .as_ref()
                    .is_some_and(|record| record.is_active(now_epoch_ms)),
                Err(_) => true,
            }
        });
        before - logins.cells.len()
    }

    #[cfg(test)]
    fn login_cell_count(&self) -> usize {
        lock_registry(&self.logins).cells.len()
    }
}

#[async_trait]
impl EngagementStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
        let mut subjects = lock_registry(&self.subjects);
        if subjects.contains_key(subject_id) {
            return Ok(false);
        }
        subjects.insert(
            subject_id.to_string(),
            Arc::new(tokio::sync::Mutex::new(SubjectCell {
                deleted: false,
                view_count: 0,
                aggregate: RatingAggregate::empty(subject_id),
                votes: HashMap::new(),
            })),
        );
        Ok(true)
    }

    async fn delete_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
        let removed = lock_registry(&self.subjects).remove(subject_id);
        let Some(cell) = removed else {
            return Ok(false);
        };

        // Writers that fetched the cell before removal observe the tombstone.
        let mut cell = cell.lock().await;
        cell.deleted = true;
        cell.votes.clear();
        Ok(true)
    }

    async fn subject_exists(&self, subject_id: &str) -> Result<bool, StoreError> {
        Ok(lock_registry(&self.subjects).contains_key(subject_id))
    }

    async fn increment_view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
        let cell = self.subject_cell(subject_id)?;
        let mut cell = cell.lock().await;
        if cell.deleted {
            return Err(StoreError::SubjectNotFound(subject_id.to_string()));
        }
        cell.view_count += 1;
        Ok(cell.view_count)
    }

    async fn view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
        let cell = self.subject_cell(subject_id)?;
        let cell = cell.lock().await;
        if cell.deleted {
            return Err(StoreError::SubjectNotFound(subject_id.to_string()));
        }
        Ok(cell.view_count)
    }

    async fn apply_vote(&self, vote: VoteWrite<'_>) -> Result<AppliedVote, StoreError> {
        let cell = self.subject_cell(vote.subject_id)?;
        let mut cell = cell.lock().await;
        if cell.deleted {
            return Err(StoreError::SubjectNotFound(vote.subject_id.to_string()));
        }

        let previous = cell
            .votes
            .get(vote.identity_token)
            .map(|record| record.rating_value);
        cell.aggregate.apply_vote(previous, vote.rating_value);
        cell.votes.insert(
            vote.identity_token.clone(),
            VoteRecord {
                subject_id: vote.subject_id.to_string(),
                identity_token: vote.identity_token.clone(),
                rating_value: vote.rating_value,
                ip_token_last: vote.ip_token.clone(),
                updated_at_epoch_ms: vote.now_epoch_ms,
            },
        );

        Ok(AppliedVote {
            aggregate: cell.aggregate.clone(),
            previous,
        })
    }

    async fn rating_aggregate(&self, subject_id: &str) -> Result<RatingAggregate, StoreError> {
        let cell = self.subject_cell(subject_id)?;
        let cell = cell.lock().await;
        if cell.deleted {
            return Err(StoreError::SubjectNotFound(subject_id.to_string()));
        }
        Ok(cell.aggregate.clone())
    }

    async fn vote(
        &self,
        subject_id: &str,
        identity_token: &IdentityToken,
    ) -> Result<Option<VoteRecord>, StoreError> {
        let cell = self.subject_cell(subject_id)?;
        let cell = cell.lock().await;
        if cell.deleted {
            return Err(StoreError::SubjectNotFound(subject_id.to_string()));
        }
        Ok(cell.votes.get(identity_token).cloned())
    }

    async fn login_attempt(
        &self,
        identifier: &IdentityToken,
    ) -> Result<Option<LoginAttemptRecord>, StoreError> {
        let cell = lock_registry(&self.logins).cells.get(identifier).cloned();
        match cell {
            Some(cell) => Ok(cell.lock().await.clone()),
            None => Ok(None),
        }
    }

    async fn record_login_failure(
        &self,
        identifier: &IdentityToken,
        policy: &LoginPolicy,
        now_epoch_ms: i64,
    ) -> Result<LoginAttemptRecord, StoreError> {
        let next = {
            let cell = self.login_cell(identifier);
            let mut slot = cell.lock().await;
            let next =
                LoginAttemptRecord::after_failure(slot.take(), identifier, policy, now_epoch_ms);
            *slot = Some(next.clone());
            next
        };
        self.prune_expired_logins(policy, now_epoch_ms);
        Ok(next)
    }

    async fn clear_login_attempts(&self, identifier: &IdentityToken) -> Result<bool, StoreError> {
        let cell = {
            let mut logins = lock_registry(&self.logins);
            let Some(cell) = logins.cells.get(identifier).cloned() else {
                return Ok(false);
            };
            // Only the registry and this clone hold the cell: nobody can reach
            // it without the registry lock, so dropping it is race free.
            if Arc::strong_count(&cell) == 2 {
                logins.cells.remove(identifier);
                return Ok(cell.try_lock().map(|slot| slot.is_some()).unwrap_or(true));
            }
            cell
        };

        let mut slot = cell.lock().await;
        Ok(slot.take().is_some())
    }
}
