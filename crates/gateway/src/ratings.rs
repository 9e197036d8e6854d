use std::sync::Arc;

use engage_contracts::{IdentityToken, RATING_MAX, RATING_MIN, RatingSummary, is_valid_rating};
use engage_store::{EngagementStore, VoteWrite, unix_epoch_ms_now};

use crate::error::EngageError;

#[derive(Debug, Clone, PartialEq)]
pub struct RatingSubmission {
    pub average: f64,
    pub count: i64,
    pub effective_rating: u8,
}

impl From<RatingSubmission> for RatingSummary {
    fn from(value: RatingSubmission) -> Self {
        RatingSummary {
            average: value.average,
            count: value.count,
            caller_rating: Some(value.effective_rating),
        }
    }
}

/// Per-subject star ratings where each identity holds exactly one live vote.
#[derive(Clone)]
pub struct RatingAggregator {
    store: Arc<dyn EngagementStore>,
    conflict_max_attempts: u32,
}

impl RatingAggregator {
    pub fn new(store: Arc<dyn EngagementStore>, conflict_max_attempts: u32) -> Self {
        Self {
            store,
            conflict_max_attempts: conflict_max_attempts.max(1),
        }
    }

    pub async fn submit_rating(
        &self,
        subject_id: &str,
        identity: &IdentityToken,
        ip_token: &IdentityToken,
        rating_value: i64,
    ) -> Result<RatingSubmission, EngageError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(EngageError::InvalidInput("subjectId is required".to_string()));
        }
        if !is_valid_rating(rating_value) {
            return Err(EngageError::InvalidInput(format!(
                "rating must be an integer between {} and {}",
                RATING_MIN, RATING_MAX
            )));
        }
        let rating_value = rating_value as u8;

        let mut attempt = 1;
        let applied = loop {
            let result = self
                .store
                .apply_vote(VoteWrite {
                    subject_id,
                    identity_token: identity,
                    ip_token,
                    rating_value,
                    now_epoch_ms: unix_epoch_ms_now(),
                })
                .await;

            match result {
                Ok(applied) => break applied,
                // Conflicts roll back before commit, so replaying cannot double count.
                Err(err) if err.is_retryable() && attempt < self.conflict_max_attempts => {
                    crate::metrics::inc_storage_conflict_retry();
                    tracing::debug!(subject_id = %subject_id, attempt, "rating.conflict_retry");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let revote = applied.previous.is_some();
        crate::metrics::observe_rating(if revote { "revote" } else { "new" });
        tracing::debug!(
            subject_id = %subject_id,
            identity = %identity,
            revote,
            count = applied.aggregate.count,
            "rating.applied"
        );

        Ok(RatingSubmission {
            average: applied.aggregate.average(),
            count: applied.aggregate.count,
            effective_rating: rating_value,
        })
    }

    /// Read-only summary; `caller_rating` is the identity's own live vote.
    pub async fn rating_summary(
        &self,
        subject_id: &str,
        identity: Option<&IdentityToken>,
    ) -> Result<RatingSummary, EngageError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(EngageError::InvalidInput("subjectId is required".to_string()));
        }

        let aggregate = self.store.rating_aggregate(subject_id).await?;
        let caller_rating = match identity {
            Some(identity) => self
                .store
                .vote(subject_id, identity)
                .await?
                .map(|vote| vote.rating_value),
            None => None,
        };

        Ok(RatingSummary {
            average: aggregate.average(),
            count: aggregate.count,
            caller_rating,
        })
    }
}
