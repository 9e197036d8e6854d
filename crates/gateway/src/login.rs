use std::future::Future;
use std::sync::Arc;

use engage_contracts::{IdentityToken, LoginCheck};
use engage_store::{EngagementStore, LoginAttemptRecord, LoginPolicy, unix_epoch_ms_now};

use crate::error::EngageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginAttemptOutcome {
    Authenticated,
    /// Verification failed; carries the allowance left after recording it.
    Rejected(LoginCheck),
}

/// Failed-attempt throttle keyed by the hashed username/client pair.
///
/// The window opens at the first failure and does not move on later ones.
#[derive(Clone)]
pub struct LoginAttemptLimiter {
    store: Arc<dyn EngagementStore>,
    policy: LoginPolicy,
}

impl LoginAttemptLimiter {
    pub fn new(store: Arc<dyn EngagementStore>, policy: LoginPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &LoginPolicy {
        &self.policy
    }

    pub async fn check(&self, identifier: &IdentityToken) -> Result<LoginCheck, EngageError> {
        self.check_at(identifier, unix_epoch_ms_now()).await
    }

    pub(crate) async fn check_at(
        &self,
        identifier: &IdentityToken,
        now_epoch_ms: i64,
    ) -> Result<LoginCheck, EngageError> {
        let record = self.store.login_attempt(identifier).await?;
        Ok(self.evaluate(record.as_ref(), now_epoch_ms))
    }

    /// Like [`Self::check`], but a locked identifier fails with
    /// [`EngageError::RateLimited`]. `Retry-After` and `resetAt` derive from
    /// the same clock reading as the check.
    pub async fn ensure_allowed(
        &self,
        identifier: &IdentityToken,
    ) -> Result<LoginCheck, EngageError> {
        self.ensure_allowed_at(identifier, unix_epoch_ms_now()).await
    }

    pub(crate) async fn ensure_allowed_at(
        &self,
        identifier: &IdentityToken,
        now_epoch_ms: i64,
    ) -> Result<LoginCheck, EngageError> {
        let check = self.check_at(identifier, now_epoch_ms).await?;
        if !check.allowed {
            crate::metrics::observe_login("locked");
            return Err(locked_error(&check, now_epoch_ms));
        }
        Ok(check)
    }

    pub async fn record_failure(
        &self,
        identifier: &IdentityToken,
    ) -> Result<LoginCheck, EngageError> {
        self.record_failure_at(identifier, unix_epoch_ms_now()).await
    }

    pub(crate) async fn record_failure_at(
        &self,
        identifier: &IdentityToken,
        now_epoch_ms: i64,
    ) -> Result<LoginCheck, EngageError> {
        let record = self
            .store
            .record_login_failure(identifier, &self.policy, now_epoch_ms)
            .await?;
        tracing::debug!(
            identifier = %identifier,
            failure_count = record.failure_count,
            "login.failure_recorded"
        );
        Ok(self.evaluate(Some(&record), now_epoch_ms))
    }

    /// Clears any failure record, whatever its count.
    pub async fn record_success(&self, identifier: &IdentityToken) -> Result<(), EngageError> {
        self.store.clear_login_attempts(identifier).await?;
        Ok(())
    }

    /// Gate around one credential verification.
    ///
    /// A locked identifier fails with [`EngageError::RateLimited`] and
    /// `verify` is never polled.
    pub async fn check_and_record_failure<F, Fut>(
        &self,
        identifier: &IdentityToken,
        verify: F,
    ) -> Result<LoginAttemptOutcome, EngageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.ensure_allowed(identifier).await?;

        if verify().await {
            self.record_success(identifier).await?;
            crate::metrics::observe_login("authenticated");
            return Ok(LoginAttemptOutcome::Authenticated);
        }

        let after = self.record_failure(identifier).await?;
        crate::metrics::observe_login("rejected");
        Ok(LoginAttemptOutcome::Rejected(after))
    }

    fn evaluate(&self, record: Option<&LoginAttemptRecord>, now_epoch_ms: i64) -> LoginCheck {
        let max = self.policy.max_attempts;
        match record {
            Some(record) if record.is_locked(&self.policy, now_epoch_ms) => LoginCheck {
                allowed: false,
                remaining: 0,
                reset_at: Some(record.window_expires_at_epoch_ms),
            },
            Some(record) if record.is_active(now_epoch_ms) => LoginCheck {
                allowed: true,
                remaining: max.saturating_sub(record.failure_count),
                reset_at: None,
            },
            _ => LoginCheck {
                allowed: true,
                remaining: max,
                reset_at: None,
            },
        }
    }
}

/// Maps a refused check onto the actionable lockout error.
pub fn locked_error(check: &LoginCheck, now_epoch_ms: i64) -> EngageError {
    let reset_at_epoch_ms = check.reset_at.unwrap_or(now_epoch_ms);
    let remaining_ms = reset_at_epoch_ms.saturating_sub(now_epoch_ms).max(0) as u64;
    EngageError::RateLimited {
        reset_at_epoch_ms,
        retry_after_secs: remaining_ms.div_ceil(1000).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use engage_contracts::identity::login_identifier;
    use engage_store::MemoryStore;

    fn limiter(max_attempts: u32, lockout: Duration) -> LoginAttemptLimiter {
        LoginAttemptLimiter::new(
            Arc::new(MemoryStore::new()),
            LoginPolicy {
                max_attempts,
                lockout,
            },
        )
    }

    fn u1() -> IdentityToken {
        login_identifier("u1", "10.0.0.1").expect("identifier")
    }

    #[tokio::test]
    async fn five_failures_lock_until_window_end() {
        let lockout = Duration::from_secs(900);
        let limiter = limiter(5, lockout);
        let id = u1();
        let start = 1_000_000;

        for n in 1..=5u32 {
            let check = limiter
                .record_failure_at(&id, start + n as i64)
                .await
                .expect("failure");
            assert_eq!(check.remaining, 5 - n);
        }

        let sixth = limiter.check_at(&id, start + 10).await.expect("check");
        assert!(!sixth.allowed);
        assert_eq!(sixth.reset_at, Some(start + 1 + 900_000));

        // Further failures while locked do not extend or grow the record.
        limiter.record_failure_at(&id, start + 20).await.expect("failure");
        let record = limiter
            .store
            .login_attempt(&id)
            .await
            .expect("read")
            .expect("record");
        assert_eq!(record.failure_count, 5);
        assert_eq!(record.window_expires_at_epoch_ms, start + 1 + 900_000);
    }

    #[tokio::test]
    async fn lock_lifts_once_window_has_passed() {
        let limiter = limiter(2, Duration::from_secs(60));
        let id = u1();

        limiter.record_failure_at(&id, 0).await.expect("failure");
        limiter.record_failure_at(&id, 1).await.expect("failure");
        assert!(!limiter.check_at(&id, 60_000).await.expect("check").allowed);

        let after = limiter.check_at(&id, 60_001).await.expect("check");
        assert!(after.allowed);
        assert_eq!(after.remaining, 2);

        let fresh = limiter.record_failure_at(&id, 60_002).await.expect("failure");
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test]
    async fn success_resets_the_count() {
        let limiter = limiter(5, Duration::from_secs(900));
        let id = u1();
        for _ in 0..3 {
            limiter.record_failure(&id).await.expect("failure");
        }
        limiter.record_success(&id).await.expect("success");

        let check = limiter.record_failure(&id).await.expect("failure");
        assert_eq!(check.remaining, 4);
    }

    #[tokio::test]
    async fn identifiers_are_isolated() {
        let limiter = limiter(1, Duration::from_secs(900));
        let a = login_identifier("u1", "10.0.0.1").expect("identifier");
        let b = login_identifier("u1", "10.0.0.2").expect("identifier");

        limiter.record_failure(&a).await.expect("failure");
        assert!(!limiter.check(&a).await.expect("check").allowed);
        assert!(limiter.check(&b).await.expect("check").allowed);
    }

    #[tokio::test]
    async fn locked_identifier_skips_verification() {
        let limiter = limiter(1, Duration::from_secs(900));
        let id = u1();
        limiter.record_failure(&id).await.expect("failure");

        let mut called = false;
        let err = limiter
            .check_and_record_failure(&id, || {
                called = true;
                async { true }
            })
            .await
            .unwrap_err();

        assert!(!called);
        match err {
            EngageError::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs > 0 && retry_after_secs <= 900),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn credential_flow_records_and_resets() {
        let limiter = limiter(3, Duration::from_secs(900));
        let id = u1();

        let rejected = limiter
            .check_and_record_failure(&id, || async { false })
            .await
            .expect("flow");
        assert_eq!(
            rejected,
            LoginAttemptOutcome::Rejected(LoginCheck {
                allowed: true,
                remaining: 2,
                reset_at: None,
            })
        );

        let ok = limiter
            .check_and_record_failure(&id, || async { true })
            .await
            .expect("flow");
        assert_eq!(ok, LoginAttemptOutcome::Authenticated);
        assert!(limiter.store.login_attempt(&id).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn lockout_error_derives_from_the_check_instant() {
        let limiter = limiter(1, Duration::from_secs(900));
        let id = u1();
        limiter.record_failure_at(&id, 0).await.expect("failure");

        for (now, expected_retry) in [(0, 900), (899_001, 1), (450_000, 450)] {
            match limiter.ensure_allowed_at(&id, now).await.unwrap_err() {
                EngageError::RateLimited {
                    reset_at_epoch_ms,
                    retry_after_secs,
                } => {
                    assert_eq!(reset_at_epoch_ms, 900_000);
                    assert_eq!(retry_after_secs, expected_retry, "now={now}");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        let open = limiter.ensure_allowed_at(&id, 900_001).await.expect("allowed");
        assert_eq!(open.remaining, 1);
    }

    #[test]
    fn locked_error_rounds_retry_after_up() {
        let check = LoginCheck {
            allowed: false,
            remaining: 0,
            reset_at: Some(10_500),
        };
        match locked_error(&check, 9_000) {
            EngageError::RateLimited {
                reset_at_epoch_ms,
                retry_after_secs,
            } => {
                assert_eq!(reset_at_epoch_ms, 10_500);
                assert_eq!(retry_after_secs, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
