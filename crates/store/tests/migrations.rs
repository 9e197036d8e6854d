use std::time::Duration;

use engage_contracts::identity::hash_identity;
use engage_store::{EngagementStore, LoginPolicy, PgStore, StoreError, VoteWrite};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("ENGAGE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn isolated_store(db_url: &str) -> (PgStore, sqlx::PgPool) {
    let schema = format!("engage_test_{}", ulid::Ulid::new()).to_lowercase();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .after_connect({
            let schema = schema.clone();
            move |conn, _meta| {
                let schema = schema.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            }
        })
        .connect(db_url)
        .await
        .expect("DB connect should succeed");

    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    engage_store::migrate(&pool)
        .await
        .expect("migrations should apply");
    engage_store::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    (PgStore::from_pool(pool.clone(), Duration::from_secs(5)), pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_enforce_vote_bounds_and_uniqueness() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set ENGAGE_TEST_DB_URL to enable");
        return;
    };
    let (_store, pool) = isolated_store(&db_url).await;

    let token = hash_identity("fp").expect("token");

    sqlx::query("INSERT INTO engage_subjects (subject_id) VALUES ($1)")
        .bind("m1")
        .execute(&pool)
        .await
        .expect("insert subject should succeed");

    let out_of_range = sqlx::query(
        "INSERT INTO engage_votes (subject_id, identity_token, rating_value, ip_token_last, updated_at_epoch_ms) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind("m1")
    .bind(token.as_str())
    .bind(6_i16)
    .bind(token.as_str())
    .bind(0_i64)
    .execute(&pool)
    .await;
    assert!(out_of_range.is_err(), "rating 6 must be rejected");

    for _ in 0..2 {
        let _ = sqlx::query(
            "INSERT INTO engage_votes (subject_id, identity_token, rating_value, ip_token_last, updated_at_epoch_ms) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind("m1")
        .bind(token.as_str())
        .bind(3_i16)
        .bind(token.as_str())
        .bind(0_i64)
        .execute(&pool)
        .await;
    }

    let row = sqlx::query("SELECT count(*) AS n FROM engage_votes WHERE subject_id = $1")
        .bind("m1")
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
    assert_eq!(row.get::<i64, _>("n"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pg_store_applies_votes_with_delta_accounting() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB store test; set ENGAGE_TEST_DB_URL to enable");
        return;
    };
    let (store, _pool) = isolated_store(&db_url).await;

    let abc = hash_identity("abc").expect("token");
    let xyz = hash_identity("xyz").expect("token");

    let missing = store
        .apply_vote(VoteWrite {
            subject_id: "m1",
            identity_token: &abc,
            ip_token: &abc,
            rating_value: 4,
            now_epoch_ms: 1,
        })
        .await;
    assert!(matches!(missing, Err(StoreError::SubjectNotFound(_))));

    assert!(store.create_subject("m1").await.expect("create"));

    for (identity, value) in [(&abc, 4u8), (&abc, 2u8), (&xyz, 5u8)] {
        store
            .apply_vote(VoteWrite {
                subject_id: "m1",
                identity_token: identity,
                ip_token: identity,
                rating_value: value,
                now_epoch_ms: 1,
            })
            .await
            .expect("vote should apply");
    }

    let aggregate = store.rating_aggregate("m1").await.expect("aggregate");
    assert_eq!(aggregate.sum, 7);
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.average(), 3.5);

    let own = store.vote("m1", &abc).await.expect("vote").expect("exists");
    assert_eq!(own.rating_value, 2);

    assert_eq!(store.increment_view_count("m1").await.expect("view"), 1);
    assert!(store.delete_subject("m1").await.expect("delete"));
    assert!(matches!(
        store.rating_aggregate("m1").await,
        Err(StoreError::SubjectNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pg_store_serializes_concurrent_votes_per_subject() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB store test; set ENGAGE_TEST_DB_URL to enable");
        return;
    };
    let (store, _pool) = isolated_store(&db_url).await;
    store.create_subject("m2").await.expect("create");

    let mut handles = Vec::new();
    for i in 0..16u8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let identity = hash_identity(&format!("voter-{}", i)).expect("token");
            store
                .apply_vote(VoteWrite {
                    subject_id: "m2",
                    identity_token: &identity,
                    ip_token: &identity,
                    rating_value: 5,
                    now_epoch_ms: 1,
                })
                .await
                .expect("vote should apply");
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let aggregate = store.rating_aggregate("m2").await.expect("aggregate");
    assert_eq!(aggregate.count, 16);
    assert_eq!(aggregate.sum, 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pg_store_login_window_is_fixed_and_clearable() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB store test; set ENGAGE_TEST_DB_URL to enable");
        return;
    };
    let (store, _pool) = isolated_store(&db_url).await;

    let identifier = hash_identity("u1:10.0.0.1").expect("token");
    let policy = LoginPolicy {
        max_attempts: 2,
        lockout: Duration::from_secs(60),
    };

    let first = store
        .record_login_failure(&identifier, &policy, 1_000)
        .await
        .expect("failure");
    let second = store
        .record_login_failure(&identifier, &policy, 5_000)
        .await
        .expect("failure");
    let third = store
        .record_login_failure(&identifier, &policy, 9_000)
        .await
        .expect("failure");

    assert_eq!(first.failure_count, 1);
    assert_eq!(second.failure_count, 2);
    assert_eq!(third.failure_count, 2);
    assert_eq!(third.window_expires_at_epoch_ms, 61_000);

    assert!(store.clear_login_attempts(&identifier).await.expect("clear"));
    assert!(
        store
            .login_attempt(&identifier)
            .await
            .expect("read")
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pg_store_prunes_expired_login_rows_on_failure() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB store test; set ENGAGE_TEST_DB_URL to enable");
        return;
    };
    let (store, pool) = isolated_store(&db_url).await;
    let policy = LoginPolicy {
        max_attempts: 5,
        lockout: Duration::from_millis(1),
    };

    for i in 0..20i64 {
        let identifier = hash_identity(&format!("user-{}:10.0.0.1", i)).expect("token");
        store
            .record_login_failure(&identifier, &policy, i)
            .await
            .expect("failure");
    }

    let late = hash_identity("late:10.0.0.1").expect("token");
    store
        .record_login_failure(&late, &policy, 10_000)
        .await
        .expect("failure");

    let rows: i64 = sqlx::query("SELECT COUNT(*) AS n FROM engage_login_attempts")
        .fetch_one(&pool)
        .await
        .expect("count")
        .try_get("n")
        .expect("n");
    assert_eq!(rows, 1);
    assert!(store.login_attempt(&late).await.expect("read").is_some());
}
