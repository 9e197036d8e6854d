use std::time::{Duration, Instant};

use engage_contracts::{IdentityToken, ViewOutcome};
use engage_store::{EngagementStore, StoreError};

use crate::error::EngageError;
use crate::expiring::ExpiringKeyStore;

pub type ViewKey = (String, IdentityToken);

/// Decides whether a view from one identity should reach the durable counter.
///
/// The marker is fixed at the first counted view and is not refreshed by the
/// views it suppresses.
#[derive(Clone)]
pub struct ViewDeduplicator {
    seen: ExpiringKeyStore<ViewKey>,
    window: Duration,
}

impl ViewDeduplicator {
    pub fn new(seen: ExpiringKeyStore<ViewKey>, window: Duration) -> Self {
        Self { seen, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true and marks the pair when no live marker exists; the caller
    /// then owes exactly one durable increment. A suppressed call leaves the
    /// marker untouched.
    pub fn should_count_view(&self, subject_id: &str, identity: &IdentityToken) -> bool {
        self.should_count_view_at(subject_id, identity, Instant::now())
    }

    pub(crate) fn should_count_view_at(
        &self,
        subject_id: &str,
        identity: &IdentityToken,
        now: Instant,
    ) -> bool {
        self.seen.insert_if_absent_at(
            (subject_id.to_string(), identity.clone()),
            self.window,
            now,
        )
    }

    /// Dedup decision plus the durable increment.
    ///
    /// Unknown subjects are rejected before any marker is placed; a subject
    /// deleted between the check and the increment clears its marker again.
    /// Any other store failure keeps the marker: the view is missed rather
    /// than counted twice.
    pub async fn record_view(
        &self,
        store: &dyn EngagementStore,
        subject_id: &str,
        identity: &IdentityToken,
    ) -> Result<ViewOutcome, EngageError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(EngageError::InvalidInput("subjectId is required".to_string()));
        }

        if !store.subject_exists(subject_id).await? {
            crate::metrics::observe_view("not_found");
            return Err(EngageError::SubjectNotFound(subject_id.to_string()));
        }

        if !self.should_count_view(subject_id, identity) {
            crate::metrics::observe_view("deduplicated");
            return Ok(ViewOutcome::Deduplicated);
        }

        match store.increment_view_count(subject_id).await {
            Ok(view_count) => {
                crate::metrics::observe_view("counted");
                Ok(ViewOutcome::Counted(view_count))
            }
            Err(StoreError::SubjectNotFound(missing)) => {
                self.seen.remove(&(subject_id.to_string(), identity.clone()));
                crate::metrics::observe_view("not_found");
                Err(EngageError::SubjectNotFound(missing))
            }
            Err(err) => {
                crate::metrics::inc_view_marked_unapplied();
                tracing::warn!(subject_id = %subject_id, error = %err, "view.increment_failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engage_contracts::identity::hash_identity;
    use engage_store::{
        AppliedVote, LoginAttemptRecord, LoginPolicy, MemoryStore, RatingAggregate, VoteRecord,
        VoteWrite,
    };

    fn dedup(window: Duration) -> ViewDeduplicator {
        ViewDeduplicator::new(ExpiringKeyStore::new(64), window)
    }

    fn token(raw: &str) -> IdentityToken {
        hash_identity(raw).expect("token")
    }

    #[test]
    fn repeat_within_window_is_suppressed_then_counted_after() {
        let views = dedup(Duration::from_secs(600));
        let x = token("x");
        let now = Instant::now();

        assert!(views.should_count_view_at("S", &x, now));
        assert!(!views.should_count_view_at("S", &x, now + Duration::from_secs(599)));
        assert!(views.should_count_view_at("S", &x, now + Duration::from_secs(600)));
    }

    #[test]
    fn suppressed_views_do_not_slide_the_window() {
        let views = dedup(Duration::from_secs(10));
        let x = token("x");
        let now = Instant::now();

        assert!(views.should_count_view_at("S", &x, now));
        for secs in 1..10 {
            assert!(!views.should_count_view_at("S", &x, now + Duration::from_secs(secs)));
        }
        assert!(views.should_count_view_at("S", &x, now + Duration::from_secs(10)));
    }

    #[test]
    fn subjects_and_identities_are_independent() {
        let views = dedup(Duration::from_secs(600));
        let now = Instant::now();
        assert!(views.should_count_view_at("S1", &token("x"), now));
        assert!(views.should_count_view_at("S2", &token("x"), now));
        assert!(views.should_count_view_at("S1", &token("y"), now));
    }

    #[tokio::test]
    async fn record_view_counts_once_per_window() {
        let store = MemoryStore::new();
        store.create_subject("M2").await.expect("create");
        let views = dedup(Duration::from_millis(30));
        let q = token("q");

        assert_eq!(
            views.record_view(&store, "M2", &q).await.expect("view"),
            ViewOutcome::Counted(1)
        );
        assert_eq!(
            views.record_view(&store, "M2", &q).await.expect("view"),
            ViewOutcome::Deduplicated
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            views.record_view(&store, "M2", &q).await.expect("view"),
            ViewOutcome::Counted(2)
        );
    }

    #[tokio::test]
    async fn unknown_subject_leaves_no_marker() {
        let store = MemoryStore::new();
        let views = dedup(Duration::from_secs(600));
        let q = token("q");

        let err = views.record_view(&store, "nope", &q).await.unwrap_err();
        assert!(matches!(err, EngageError::SubjectNotFound(_)));
        assert!(views.should_count_view("nope", &q));
    }

    #[tokio::test]
    async fn blank_subject_is_invalid_input() {
        let store = MemoryStore::new();
        let views = dedup(Duration::from_secs(600));
        let err = views.record_view(&store, "  ", &token("q")).await.unwrap_err();
        assert!(matches!(err, EngageError::InvalidInput(_)));
    }

    enum IncrementFault {
        Unavailable,
        TimedOut,
        /// The subject disappears after the existence check passed.
        DeletedMidFlight,
    }

    /// Memory store whose view increments fail in a chosen way.
    struct FaultyViewStore {
        inner: MemoryStore,
        fault: IncrementFault,
    }

    #[async_trait]
    impl EngagementStore for FaultyViewStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
        async fn create_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
            self.inner.create_subject(subject_id).await
        }
        async fn delete_subject(&self, subject_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_subject(subject_id).await
        }
        async fn subject_exists(&self, subject_id: &str) -> Result<bool, StoreError> {
            self.inner.subject_exists(subject_id).await
        }
        async fn increment_view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
            match self.fault {
                IncrementFault::Unavailable => {
                    Err(StoreError::Unavailable("pool closed".to_string()))
                }
                IncrementFault::TimedOut => Err(StoreError::Timeout),
                IncrementFault::DeletedMidFlight => {
                    self.inner.delete_subject(subject_id).await?;
                    self.inner.increment_view_count(subject_id).await
                }
            }
        }
        async fn view_count(&self, subject_id: &str) -> Result<i64, StoreError> {
            self.inner.view_count(subject_id).await
        }
        async fn apply_vote(&self, vote: VoteWrite<'_>) -> Result<AppliedVote, StoreError> {
            self.inner.apply_vote(vote).await
        }
        async fn rating_aggregate(&self, subject_id: &str) -> Result<RatingAggregate, StoreError> {
            self.inner.rating_aggregate(subject_id).await
        }
        async fn vote(
            &self,
            subject_id: &str,
            identity_token: &IdentityToken,
        ) -> Result<Option<VoteRecord>, StoreError> {
            self.inner.vote(subject_id, identity_token).await
        }
        async fn login_attempt(
            &self,
            identifier: &IdentityToken,
        ) -> Result<Option<LoginAttemptRecord>, StoreError> {
            self.inner.login_attempt(identifier).await
        }
        async fn record_login_failure(
            &self,
            identifier: &IdentityToken,
            policy: &LoginPolicy,
            now_epoch_ms: i64,
        ) -> Result<LoginAttemptRecord, StoreError> {
            self.inner
                .record_login_failure(identifier, policy, now_epoch_ms)
                .await
        }
        async fn clear_login_attempts(
            &self,
            identifier: &IdentityToken,
        ) -> Result<bool, StoreError> {
            self.inner.clear_login_attempts(identifier).await
        }
    }

    async fn faulty(fault: IncrementFault) -> FaultyViewStore {
        let inner = MemoryStore::new();
        inner.create_subject("S").await.expect("create");
        FaultyViewStore { inner, fault }
    }

    #[tokio::test]
    async fn failed_increment_keeps_marker_and_is_counted_as_unapplied() {
        for fault in [IncrementFault::Unavailable, IncrementFault::TimedOut] {
            let store = faulty(fault).await;
            let views = dedup(Duration::from_secs(600));
            let q = token("q");
            let unapplied_before = crate::metrics::views_marked_unapplied();

            let err = views.record_view(&store, "S", &q).await.unwrap_err();
            assert!(matches!(err, EngageError::StoreUnavailable(_)));
            assert!(crate::metrics::views_marked_unapplied() > unapplied_before);

            // The marker stands, so a retry is suppressed rather than recounted.
            assert_eq!(
                views.record_view(&store, "S", &q).await.expect("view"),
                ViewOutcome::Deduplicated
            );
            assert!(views.seen.get(&("S".to_string(), q.clone())));
            assert_eq!(store.inner.view_count("S").await.expect("count"), 0);
        }
    }

    #[tokio::test]
    async fn subject_deleted_before_increment_clears_marker() {
        let store = faulty(IncrementFault::DeletedMidFlight).await;
        let views = dedup(Duration::from_secs(600));
        let q = token("q");

        let err = views.record_view(&store, "S", &q).await.unwrap_err();
        assert!(matches!(err, EngageError::SubjectNotFound(id) if id == "S"));
        assert!(!views.seen.get(&("S".to_string(), q.clone())));
        assert!(!store.inner.subject_exists("S").await.expect("exists"));
    }
}
