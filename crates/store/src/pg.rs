use std::time::Duration;

use async_trait::async_trait;
use engage_contracts::IdentityToken;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, Row, Transaction};

use crate::{
    AppliedVote, EngagementStore, LoginAttemptRecord, LoginPolicy, RatingAggregate, StoreError,
    VoteRecord, VoteWrite,
};

#[derive(Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            op_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: sqlx::PgPool, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Serializes writers on one key for the rest of the transaction.
async fn lock_key(tx: &mut Transaction<'_, Postgres>, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

const LOGIN_PRUNE_BATCH: i64 = 100;

fn subject_lock_key(subject_id: &str) -> String {
    format!("engage:subject:{}", subject_id)
}

fn login_lock_key(identifier: &IdentityToken) -> String {
    format!("engage:login:{}", identifier)
}

fn rating_from_column(value: i16) -> Result<u8, StoreError> {
    u8::try_from(value)
        .ok()
        .filter(|v| (1..=5).contains(v))
        .ok_or(StoreError::InvalidRecord("rating_value out of range"))
}

fn failure_count_from_column(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRecord("failure_count negative"))
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(
            Duration::from_millis(500),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    async fn create_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
        let result = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "INSERT INTO engage_subjects (subject_id, view_count) VALUES ($1, 0) ON CONFLICT (subject_id) DO NOTHING",
            )
            .bind(subject_id)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
        let deleted = tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            lock_key(&mut tx, &subject_lock_key(subject_id)).await?;

            let result = sqlx::query("DELETE FROM engage_subjects WHERE subject_id = $1")
                .bind(subject_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<bool, sqlx::Error>(result.rows_affected() == 1)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(deleted)
    }

    async fn subject_exists(&self, subject_id: &str) -> Result<bool, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT 1 FROM engage_subjects WHERE subject_id = $1")
                .bind(subject_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(row.is_some())
    }

    async fn increment_view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "UPDATE engage_subjects SET view_count = view_count + 1 WHERE subject_id = $1 RETURNING view_count",
            )
            .bind(subject_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let row = row.ok_or_else(|| StoreError::SubjectNotFound(subject_id.to_string()))?;
        Ok(row.try_get::<i64, _>("view_count")?)
    }

    async fn view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT view_count FROM engage_subjects WHERE subject_id = $1")
                .bind(subject_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let row = row.ok_or_else(|| StoreError::SubjectNotFound(subject_id.to_string()))?;
        Ok(row.try_get::<i64, _>("view_count")?)
    }

    async fn apply_vote(&self, vote: VoteWrite<'_>) -> Result<AppliedVote, StoreError> {
        let subject_id = vote.subject_id;

        tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            lock_key(&mut tx, &subject_lock_key(subject_id)).await?;

            let row = sqlx::query(
                "SELECT a.rating_sum, a.rating_count FROM engage_subjects s LEFT JOIN engage_rating_aggregates a ON a.subject_id = s.subject_id WHERE s.subject_id = $1",
            )
            .bind(subject_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::SubjectNotFound(subject_id.to_string()))?;

            let mut aggregate = RatingAggregate {
                subject_id: subject_id.to_string(),
                sum: row.try_get::<Option<i64>, _>("rating_sum")?.unwrap_or(0),
                count: row.try_get::<Option<i64>, _>("rating_count")?.unwrap_or(0),
            };

            let previous = sqlx::query(
                "SELECT rating_value FROM engage_votes WHERE subject_id = $1 AND identity_token = $2",
            )
            .bind(subject_id)
            .bind(vote.identity_token.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get::<i16, _>("rating_value"))
            .transpose()?
            .map(rating_from_column)
            .transpose()?;

            aggregate.apply_vote(previous, vote.rating_value);

            sqlx::query(
                "INSERT INTO engage_rating_aggregates (subject_id, rating_sum, rating_count) VALUES ($1, $2, $3) ON CONFLICT (subject_id) DO UPDATE SET rating_sum = EXCLUDED.rating_sum, rating_count = EXCLUDED.rating_count",
            )
            .bind(subject_id)
            .bind(aggregate.sum)
            .bind(aggregate.count)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO engage_votes (subject_id, identity_token, rating_value, ip_token_last, updated_at_epoch_ms) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (subject_id, identity_token) DO UPDATE SET rating_value = EXCLUDED.rating_value, ip_token_last = EXCLUDED.ip_token_last, updated_at_epoch_ms = EXCLUDED.updated_at_epoch_ms",
            )
            .bind(subject_id)
            .bind(vote.identity_token.as_str())
            .bind(i16::from(vote.rating_value))
            .bind(vote.ip_token.as_str())
            .bind(vote.now_epoch_ms)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<AppliedVote, StoreError>(AppliedVote {
                aggregate,
                previous,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    async fn rating_aggregate(&self, subject_id: &str) -> Result<RatingAggregate, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "SELECT a.rating_sum, a.rating_count FROM engage_subjects s LEFT JOIN engage_rating_aggregates a ON a.subject_id = s.subject_id WHERE s.subject_id = $1",
            )
            .bind(subject_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let row = row.ok_or_else(|| StoreError::SubjectNotFound(subject_id.to_string()))?;
        Ok(RatingAggregate {
            subject_id: subject_id.to_string(),
            sum: row.try_get::<Option<i64>, _>("rating_sum")?.unwrap_or(0),
            count: row.try_get::<Option<i64>, _>("rating_count")?.unwrap_or(0),
        })
    }

    async fn vote(
        &self,
        subject_id: &str,
        identity_token: &IdentityToken,
    ) -> Result<Option<VoteRecord>, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "SELECT rating_value, ip_token_last, updated_at_epoch_ms FROM engage_votes WHERE subject_id = $1 AND identity_token = $2",
            )
            .bind(subject_id)
            .bind(identity_token.as_str())
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let ip_token_last = IdentityToken::from_stored(row.try_get::<String, _>("ip_token_last")?)
            .ok_or(StoreError::InvalidRecord("ip_token_last is not a token"))?;

        Ok(Some(VoteRecord {
            subject_id: subject_id.to_string(),
            identity_token: identity_token.clone(),
            rating_value: rating_from_column(row.try_get::<i16, _>("rating_value")?)?,
            ip_token_last,
            updated_at_epoch_ms: row.try_get::<i64, _>("updated_at_epoch_ms")?,
        }))
    }

    async fn login_attempt(
        &self,
        identifier: &IdentityToken,
    ) -> Result<Option<LoginAttemptRecord>, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "SELECT failure_count, window_expires_at_epoch_ms FROM engage_login_attempts WHERE identifier = $1",
            )
            .bind(identifier.as_str())
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(LoginAttemptRecord {
            identifier: identifier.clone(),
            failure_count: failure_count_from_column(row.try_get::<i32, _>("failure_count")?)?,
            window_expires_at_epoch_ms: row.try_get::<i64, _>("window_expires_at_epoch_ms")?,
        }))
    }

    async fn record_login_failure(
        &self,
        identifier: &IdentityToken,
        policy: &LoginPolicy,
        now_epoch_ms: i64,
    ) -> Result<LoginAttemptRecord, StoreError> {
        tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            lock_key(&mut tx, &login_lock_key(identifier)).await?;

            let existing = sqlx::query(
                "SELECT failure_count, window_expires_at_epoch_ms FROM engage_login_attempts WHERE identifier = $1",
            )
            .bind(identifier.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| {
                Ok::<_, StoreError>(LoginAttemptRecord {
                    identifier: identifier.clone(),
                    failure_count: failure_count_from_column(row.try_get::<i32, _>("failure_count")?)?,
                    window_expires_at_epoch_ms: row.try_get::<i64, _>("window_expires_at_epoch_ms")?,
                })
            })
            .transpose()?;

            let next = LoginAttemptRecord::after_failure(existing.clone(), identifier, policy, now_epoch_ms);

            // Bounded cleanup of other identifiers' dead windows. Rows another
            // writer holds are skipped, so this never waits on a row lock.
            sqlx::query(
                "DELETE FROM engage_login_attempts WHERE identifier IN (SELECT identifier FROM engage_login_attempts WHERE window_expires_at_epoch_ms < $1 AND identifier <> $2 ORDER BY window_expires_at_epoch_ms LIMIT $3 FOR UPDATE SKIP LOCKED)",
            )
            .bind(now_epoch_ms)
            .bind(identifier.as_str())
            .bind(LOGIN_PRUNE_BATCH)
            .execute(&mut *tx)
            .await?;

            if existing.as_ref() != Some(&next) {
                sqlx::query(
                    "INSERT INTO engage_login_attempts (identifier, failure_count, window_expires_at_epoch_ms) VALUES ($1, $2, $3) ON CONFLICT (identifier) DO UPDATE SET failure_count = EXCLUDED.failure_count, window_expires_at_epoch_ms = EXCLUDED.window_expires_at_epoch_ms",
                )
                .bind(identifier.as_str())
                .bind(i32::try_from(next.failure_count).unwrap_or(i32::MAX))
                .bind(next.window_expires_at_epoch_ms)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok::<LoginAttemptRecord, StoreError>(next)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    async fn clear_login_attempts(&self, identifier: &IdentityToken) -> Result<bool, StoreError> {
        let deleted = tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            lock_key(&mut tx, &login_lock_key(identifier)).await?;

            let result = sqlx::query("DELETE FROM engage_login_attempts WHERE identifier = $1")
                .bind(identifier.as_str())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<bool, sqlx::Error>(result.rows_affected() == 1)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(deleted)
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
