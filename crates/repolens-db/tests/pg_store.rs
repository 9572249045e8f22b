//! Integration tests against a real PostgreSQL.
//!
//! Run explicitly with a disposable database:
//! `DATABASE_URL=postgres://... cargo test -p repolens-db -- --ignored`

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinSet;

use repolens_core::{Job, JobStatus, ResourceId};
use repolens_db::{JobStore, PgJobStore, create_pool, run_migrations};

async fn init_store() -> PgJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = create_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    PgJobStore::new(pool)
}

fn make_job() -> Job {
    Job::new(
        ResourceId::new(),
        ResourceId::new(),
        serde_json::json!({"focus": "architecture"}),
        5,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires PostgreSQL; set DATABASE_URL and run with --ignored"]
async fn concurrent_claimers_get_one_winner_per_job() {
    const WORKERS: usize = 16;

    let store = Arc::new(init_store().await);
    let job = make_job();
    store.insert(&job).await.unwrap();

    let mut set = JoinSet::new();
    for i in 0..WORKERS {
        let store = store.clone();
        set.spawn(async move {
            store
                .claim_next(&format!("worker-{i}"), Utc::now() + Duration::minutes(5))
                .await
                .unwrap()
        });
    }

    let mut winners = 0;
    while let Some(res) = set.join_next().await {
        if let Some(claimed) = res.unwrap() {
            if claimed.id == job.id {
                winners += 1;
            }
        }
    }
    assert_eq!(winners, 1, "exactly one claimer may win the job");

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Claimed);
    assert!(stored.locked_by.is_some());
    assert!(stored.lease_until.is_some());
}

#[tokio::test]
#[ignore = "requires PostgreSQL; set DATABASE_URL and run with --ignored"]
async fn dedupe_index_rejects_second_active_insert() {
    let store = init_store().await;
    let key = format!("dedupe-{}", uuid::Uuid::new_v4());

    let first = make_job().with_dedupe_key(&key);
    store.insert(&first).await.unwrap();

    let second = make_job().with_dedupe_key(&key);
    let err = store.insert(&second).await.unwrap_err();
    assert!(matches!(err, repolens_db::DbError::Duplicate(_)));

    // Completing the first frees the key for a new submission. Claim
    // until our job comes up; the test database may hold other rows.
    loop {
        match store
            .claim_next("w1", Utc::now() + Duration::minutes(5))
            .await
            .unwrap()
        {
            Some(claimed) if claimed.id == first.id => break,
            Some(_) => continue,
            None => panic!("job {} never became claimable", first.id),
        }
    }
    store.complete(first.id, "w1", None, None).await.unwrap();
    store.insert(&second).await.unwrap();
}
