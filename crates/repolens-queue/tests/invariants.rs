//! Randomized handler sequences against the queue invariants.
//!
//! Whatever order handlers run in, and whichever of them reject their
//! preconditions, every observed job must keep its lease fields paired
//! with its status.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use repolens_core::{JobId, JobStage, ResourceId, RetryPolicy};
use repolens_db::{InMemoryJobStore, InMemoryLogStore, JobStore};
use repolens_queue::{EnqueueRequest, HeartbeatUpdate, JobQueue, QueueConfig};

#[derive(Debug, Clone)]
enum Op {
    Enqueue { dedupe: Option<u8> },
    Claim { worker: u8, expired: bool },
    Heartbeat { job: u8, worker: u8, expired: bool },
    Complete { job: u8, worker: u8 },
    Retry { job: u8, worker: u8 },
    Reclaim,
    RequestCancel { job: u8 },
    Cancel { job: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::option::of(0u8..3).prop_map(|dedupe| Op::Enqueue { dedupe }),
        (0u8..3, any::<bool>()).prop_map(|(worker, expired)| Op::Claim { worker, expired }),
        (any::<u8>(), 0u8..3, any::<bool>())
            .prop_map(|(job, worker, expired)| Op::Heartbeat { job, worker, expired }),
        (any::<u8>(), 0u8..3).prop_map(|(job, worker)| Op::Complete { job, worker }),
        (any::<u8>(), 0u8..3).prop_map(|(job, worker)| Op::Retry { job, worker }),
        Just(Op::Reclaim),
        any::<u8>().prop_map(|job| Op::RequestCancel { job }),
        any::<u8>().prop_map(|job| Op::Cancel { job }),
    ]
}

fn pick(ids: &[JobId], index: u8) -> Option<JobId> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[index as usize % ids.len()])
    }
}

fn lease_for(expired: bool) -> Option<Duration> {
    if expired {
        Some(Duration::ZERO)
    } else {
        Some(Duration::from_secs(300))
    }
}

async fn apply(queue: &JobQueue, owner: ResourceId, ids: &mut Vec<JobId>, op: Op) {
    match op {
        Op::Enqueue { dedupe } => {
            let req = EnqueueRequest {
                owner_id: owner,
                repo_id: ResourceId::new(),
                prompt: serde_json::json!({}),
                dedupe_key: dedupe.map(|k| format!("key-{k}")),
            };
            if let Ok(receipt) = queue.enqueue(req).await {
                ids.push(receipt.job_id);
            }
        }
        Op::Claim { worker, expired } => {
            let _ = queue
                .claim(&format!("w{worker}"), lease_for(expired))
                .await;
        }
        Op::Heartbeat {
            job,
            worker,
            expired,
        } => {
            if let Some(id) = pick(ids, job) {
                let _ = queue
                    .heartbeat(
                        id,
                        &format!("w{worker}"),
                        HeartbeatUpdate {
                            stage: Some(JobStage::Running),
                            lease: lease_for(expired),
                            ..HeartbeatUpdate::default()
                        },
                    )
                    .await;
            }
        }
        Op::Complete { job, worker } => {
            if let Some(id) = pick(ids, job) {
                let _ = queue
                    .complete(id, &format!("w{worker}"), None, None)
                    .await;
            }
        }
        Op::Retry { job, worker } => {
            if let Some(id) = pick(ids, job) {
                let _ = queue
                    .retry_or_fail(id, &format!("w{worker}"), "induced failure")
                    .await;
            }
        }
        Op::Reclaim => {
            let _ = queue.reclaim_expired_leases().await;
        }
        Op::RequestCancel { job } => {
            if let Some(id) = pick(ids, job) {
                let _ = queue.request_cancel(id).await;
            }
        }
        Op::Cancel { job } => {
            if let Some(id) = pick(ids, job) {
                let _ = queue.cancel(id, owner).await;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lease_fields_stay_paired_with_status(
        ops in proptest::collection::vec(op_strategy(), 1..48)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        rt.block_on(async move {
            let store = Arc::new(InMemoryJobStore::new());
            let queue = JobQueue::new(
                store.clone(),
                Arc::new(InMemoryLogStore::new()),
                QueueConfig::default()
                    .with_max_attempts(3)
                    .with_retry(RetryPolicy {
                        base_delay: Duration::ZERO,
                        max_delay: Duration::ZERO,
                        jitter: Duration::ZERO,
                    }),
            );

            let owner = ResourceId::new();
            let mut ids = Vec::new();

            for op in ops {
                apply(&queue, owner, &mut ids, op).await;

                for job in store.list_recent(i64::MAX).await.unwrap() {
                    assert!(
                        job.lease_fields_consistent(),
                        "job {} in {} broke the lease pairing: locked_by={:?} lease_until={:?}",
                        job.id,
                        job.status,
                        job.locked_by,
                        job.lease_until,
                    );
                    if job.status.is_terminal() {
                        assert!(job.locked_by.is_none());
                    }
                }
            }
        });
    }
}
