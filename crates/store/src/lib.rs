//! Durable engagement records and the store seam the gateway writes through.
//!
//! Every mutation that reads before it writes (votes, login failures) runs as
//! one critical section per key inside the implementation. Keys never share a
//! lock with each other.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use engage_contracts::IdentityToken;
use serde::Serialize;

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgStore, migrate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The call did not finish in time; its commit status is unknown.
    #[error("store operation timed out")]
    Timeout,
    /// A concurrent writer won the race; the transaction was rolled back.
    #[error("concurrent update conflict")]
    Conflict,
    #[error("subject {0} not found")]
    SubjectNotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record is malformed: {0}")]
    InvalidRecord(&'static str),
    #[error("store sql error: {0}")]
    Sqlx(sqlx::Error),
}

impl StoreError {
    /// Only rolled-back conflicts are safe to replay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        // serialization_failure, deadlock_detected, unique_violation
        let conflict = matches!(
            &value,
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001" | "40P01" | "23505"))
        );
        if conflict {
            return StoreError::Conflict;
        }

        if matches!(
            value,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
        ) {
            return StoreError::Unavailable(value.to_string());
        }

        StoreError::Sqlx(value)
    }
}

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// Running rating totals for one subject. The average is always derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatingAggregate {
    pub subject_id: String,
    pub sum: i64,
    pub count: i64,
}

impl RatingAggregate {
    pub fn empty(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            sum: 0,
            count: 0,
        }
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum as f64 / self.count as f64
        } else {
            0.0
        }
    }

    /// Delta accounting: a first vote adds to both totals, a re-vote only
    /// shifts the sum by the difference from the identity's previous value.
    pub fn apply_vote(&mut self, previous: Option<u8>, value: u8) {
        match previous {
            None => {
                self.sum += i64::from(value);
                self.count += 1;
            }
            Some(previous) => {
                self.sum += i64::from(value) - i64::from(previous);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteRecord {
    pub subject_id: String,
    pub identity_token: IdentityToken,
    pub rating_value: u8,
    pub ip_token_last: IdentityToken,
    pub updated_at_epoch_ms: i64,
}

pub struct VoteWrite<'a> {
    pub subject_id: &'a str,
    pub identity_token: &'a IdentityToken,
    pub ip_token: &'a IdentityToken,
    pub rating_value: u8,
    pub now_epoch_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVote {
    pub aggregate: RatingAggregate,
    pub previous: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
}

impl LoginPolicy {
    fn lockout_ms(&self) -> i64 {
        self.lockout.as_millis().min(i64::MAX as u128) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginAttemptRecord {
    pub identifier: IdentityToken,
    pub failure_count: u32,
    pub window_expires_at_epoch_ms: i64,
}

impl LoginAttemptRecord {
    /// A record past its window is treated as absent.
    pub fn is_active(&self, now_epoch_ms: i64) -> bool {
        now_epoch_ms <= self.window_expires_at_epoch_ms
    }

    pub fn is_locked(&self, policy: &LoginPolicy, now_epoch_ms: i64) -> bool {
        self.is_active(now_epoch_ms) && self.failure_count >= policy.max_attempts
    }

    /// State after one more failure. The window is fixed at the first failure
    /// and a maxed-out record is left untouched.
    pub fn after_failure(
        existing: Option<LoginAttemptRecord>,
        identifier: &IdentityToken,
        policy: &LoginPolicy,
        now_epoch_ms: i64,
    ) -> LoginAttemptRecord {
        match existing {
            Some(record) if record.is_active(now_epoch_ms) => {
                if record.failure_count >= policy.max_attempts {
                    record
                } else {
                    LoginAttemptRecord {
                        failure_count: record.failure_count + 1,
                        ..record
                    }
                }
            }
            _ => LoginAttemptRecord {
                identifier: identifier.clone(),
                failure_count: 1,
                window_expires_at_epoch_ms: now_epoch_ms.saturating_add(policy.lockout_ms()),
            },
        }
    }
}

#[async_trait]
pub trait EngagementStore: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Returns false when the subject already existed.
    async fn create_subject(&self, subject_id: &str) -> Result<bool, StoreError>;

    /// Removes the subject together with its aggregate and vote records.
    async fn delete_subject(&self, subject_id: &str) -> Result<bool, StoreError>;

    async fn subject_exists(&self, subject_id: &str) -> Result<bool, StoreError>;

    async fn increment_view_count(&self, subject_id: &str) -> Result<i64, StoreError>;

    async fn view_count(&self, subject_id: &str) -> Result<i64, StoreError>;

    /// Applies one vote with delta accounting, atomically per subject.
    async fn apply_vote(&self, vote: VoteWrite<'_>) -> Result<AppliedVote, StoreError>;

    /// Zeroed aggregate when nobody has rated the subject yet.
    async fn rating_aggregate(&self, subject_id: &str) -> Result<RatingAggregate, StoreError>;

    async fn vote(
        &self,
        subject_id: &str,
        identity_token: &IdentityToken,
    ) -> Result<Option<VoteRecord>, StoreError>;

    async fn login_attempt(
        &self,
        identifier: &IdentityToken,
    ) -> Result<Option<LoginAttemptRecord>, StoreError>;

    /// Applies [`LoginAttemptRecord::after_failure`] atomically per identifier.
    async fn record_login_failure(
        &self,
        identifier: &IdentityToken,
        policy: &LoginPolicy,
        now_epoch_ms: i64,
    ) -> Result<LoginAttemptRecord, StoreError>;

    /// Returns true when a record was removed.
    async fn clear_login_attempts(&self, identifier: &IdentityToken) -> Result<bool, StoreError>;
}
