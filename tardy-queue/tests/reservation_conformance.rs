use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tardy_queue::{
    backend::{memory::MemoryStore, CandidateQuery, JobStore},
    reserve,
    reservation::RESERVE_BATCH,
    types::Eligibility,
    JobId, JobRecord, NewJob, QueueFilter, QueueResult, WorkerIdentity,
};

const MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);

fn worker(name: &str) -> WorkerIdentity {
    WorkerIdentity::new(name)
}

fn worker_preferring(name: &str, queues: &[&str]) -> WorkerIdentity {
    WorkerIdentity::new(name).with_queues(queues.iter().map(|q| q.parse().unwrap()).collect())
}

async fn reserve_as(store: &dyn JobStore, worker: &WorkerIdentity) -> Option<JobRecord> {
    reserve(store, worker, MAX_RUN_TIME).await.unwrap()
}

/// R1. Created jobs default `run_at` to now
async fn run_at_defaults_to_now(store: &dyn JobStore) {
    let before = Utc::now();
    let job = store.create(NewJob::new("{}")).await.unwrap();
    let after = Utc::now();

    assert!(job.run_at >= before - chrono::Duration::milliseconds(1));
    assert!(job.run_at <= after + chrono::Duration::milliseconds(1));
}

/// R2. Enqueue then reserve: first worker gets the job, second gets nothing
async fn second_worker_finds_nothing(store: &dyn JobStore) {
    // Arrange
    let job = store.create(NewJob::new("{}").with_priority(0)).await.unwrap();

    // Act
    let first = reserve_as(store, &worker("worker1")).await;
    let second = reserve_as(store, &worker("worker2")).await;

    // Assert
    assert_eq!(first.map(|j| j.id), Some(job.id));
    assert!(second.is_none());
}

/// R3. Future and failed jobs are never reserved
async fn never_reserves_future_or_failed(store: &dyn JobStore) {
    let now = Utc::now();
    store
        .create(NewJob::new("{}").with_run_at(now + chrono::Duration::minutes(10)))
        .await
        .unwrap();
    store.create(NewJob::new("{}").with_failed_at(now)).await.unwrap();

    assert!(reserve_as(store, &worker("w")).await.is_none());
}

/// R4. Queue preference order beats run_at urgency
async fn preference_order_wins(store: &dyn JobStore) {
    let now = Utc::now();
    store
        .create(NewJob::new("{}").with_queue("queue1").with_run_at(now - chrono::Duration::hours(1)))
        .await
        .unwrap();
    let preferred = store
        .create(NewJob::new("{}").with_queue("queue2").with_run_at(now - chrono::Duration::seconds(1)))
        .await
        .unwrap();

    let reserved = reserve_as(store, &worker_preferring("w", &["queue2", "queue1"])).await;
    assert_eq!(reserved.map(|j| j.id), Some(preferred.id));
}

/// R5. The wildcard is the lowest preference and matches unqueued jobs
async fn wildcard_is_fallback(store: &dyn JobStore) {
    let unqueued = store.create(NewJob::new("{}").with_priority(-10)).await.unwrap();
    let queued = store.create(NewJob::new("{}").with_queue("queue1")).await.unwrap();
    let worker = worker_preferring("w", &["queue1", "*"]);

    assert_eq!(reserve_as(store, &worker).await.map(|j| j.id), Some(queued.id));
    // A second worker, since "w" may re-claim its own fresh lock
    let other = worker_preferring("v", &["queue1", "*"]);
    assert_eq!(reserve_as(store, &other).await.map(|j| j.id), Some(unqueued.id));
}

/// R6. Named preferences never match unqueued jobs
async fn named_queue_skips_unqueued(store: &dyn JobStore) {
    store.create(NewJob::new("{}")).await.unwrap();
    assert!(reserve_as(store, &worker_preferring("w", &["queue1"])).await.is_none());
}

/// R7. Stale locks are reclaimable by anyone, fresh ones only by their owner
async fn stale_lock_rules(store: &dyn JobStore) {
    let now = Utc::now();
    let stale = chrono::Duration::from_std(MAX_RUN_TIME).unwrap() + chrono::Duration::minutes(1);

    let fresh = store.create(NewJob::new("{}").with_lock("owner", now)).await.unwrap();
    assert!(reserve_as(store, &worker("other")).await.is_none());
    assert_eq!(reserve_as(store, &worker("owner")).await.map(|j| j.id), Some(fresh.id));
    store.delete(fresh.id).await.unwrap();

    let abandoned = store.create(NewJob::new("{}").with_lock("crashed", now - stale)).await.unwrap();
    let reclaimed = reserve_as(store, &worker("other")).await.unwrap();
    assert_eq!(reclaimed.id, abandoned.id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("other"));
}

/// R8. Within a queue, lower priority then earlier run_at goes first
async fn priority_orders_within_queue(store: &dyn JobStore) {
    let now = Utc::now();
    let later = store
        .create(NewJob::new("{}").with_priority(1).with_run_at(now - chrono::Duration::seconds(5)))
        .await
        .unwrap();
    let earlier = store
        .create(NewJob::new("{}").with_priority(1).with_run_at(now - chrono::Duration::seconds(50)))
        .await
        .unwrap();
    let urgent = store.create(NewJob::new("{}").with_priority(0)).await.unwrap();

    let order: Vec<_> = [
        reserve_as(store, &worker("a")).await,
        reserve_as(store, &worker("b")).await,
        reserve_as(store, &worker("c")).await,
    ]
    .into_iter()
    .map(|j| j.unwrap().id)
    .collect();
    assert_eq!(order, vec![urgent.id, earlier.id, later.id]);
}

/// R9. Concurrent reservations: exactly one claimant per job
async fn at_most_one_claimant(store: Arc<dyn JobStore>) {
    let job = store.create(NewJob::new("{}")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            reserve(store.as_ref(), &WorkerIdentity::new(format!("worker{}", i)), MAX_RUN_TIME)
                .await
                .unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(claimed) = handle.await.unwrap() {
            winners.push(claimed);
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = store.find(job.id).await.unwrap().unwrap();
    assert_eq!(stored.locked_by, winners[0].locked_by);
}

/// R10. Concurrent workers each end up with a distinct job
async fn many_workers_drain_many_jobs(store: Arc<dyn JobStore>) {
    for _ in 0..8 {
        store.create(NewJob::new("{}")).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            reserve(store.as_ref(), &WorkerIdentity::new(format!("worker{}", i)), MAX_RUN_TIME)
                .await
                .unwrap()
                .map(|j| j.id)
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    claimed.sort();
    claimed.dedup();

    // Nobody gives up while a job is still open, and claims never overlap
    assert_eq!(claimed.len(), 8);
}

/// Store whose next `steals` claims are won by a rival worker first
struct LosingRaces {
    inner: Arc<dyn JobStore>,
    steals: AtomicUsize,
}

#[async_trait]
impl JobStore for LosingRaces {
    async fn create(&self, job: NewJob) -> QueueResult<JobRecord> {
        self.inner.create(job).await
    }

    async fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        self.inner.find(id).await
    }

    async fn candidates(&self, query: &CandidateQuery<'_>) -> QueueResult<Vec<JobRecord>> {
        self.inner.candidates(query).await
    }

    async fn claim(&self, id: JobId, eligibility: &Eligibility<'_>) -> QueueResult<Option<JobRecord>> {
        let steal = self
            .steals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if steal {
            let rival = Eligibility {
                worker_name: "rival",
                ..*eligibility
            };
            self.inner.claim(id, &rival).await?;
        }
        self.inner.claim(id, eligibility).await
    }

    async fn update(&self, record: &JobRecord) -> QueueResult<()> {
        self.inner.update(record).await
    }

    async fn delete(&self, id: JobId) -> QueueResult<bool> {
        self.inner.delete(id).await
    }

    async fn clear_locks(&self, worker_name: &str) -> QueueResult<u64> {
        self.inner.clear_locks(worker_name).await
    }

    async fn count(&self) -> QueueResult<u64> {
        self.inner.count().await
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        self.inner.delete_all().await
    }

    async fn current_time(&self) -> QueueResult<DateTime<Utc>> {
        self.inner.current_time().await
    }
}

/// R11. Losing more races than one candidate batch holds still finds the remaining job
async fn lost_batch_queries_again(store: Arc<dyn JobStore>) {
    let mut jobs = Vec::new();
    for _ in 0..RESERVE_BATCH + 2 {
        jobs.push(store.create(NewJob::new("{}")).await.unwrap());
    }
    let contended = LosingRaces {
        inner: store.clone(),
        steals: AtomicUsize::new(RESERVE_BATCH + 1),
    };

    let reserved = reserve_as(&contended, &worker("me")).await;
    let last = jobs.last().unwrap().id;
    assert_eq!(reserved.map(|j| j.id), Some(last));

    for job in &jobs[..jobs.len() - 1] {
        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.locked_by.as_deref(), Some("rival"));
    }
}

/// R12. Once every candidate is gone the next preference entry is tried
async fn exhausted_entry_falls_through(store: Arc<dyn JobStore>) {
    store.create(NewJob::new("{}").with_queue("mail")).await.unwrap();
    let fallback = store.create(NewJob::new("{}").with_queue("reports")).await.unwrap();
    let contended = LosingRaces {
        inner: store.clone(),
        steals: AtomicUsize::new(1),
    };

    let reserved = reserve_as(&contended, &worker_preferring("me", &["mail", "reports"])).await;
    assert_eq!(reserved.map(|j| j.id), Some(fallback.id));
}

macro_rules! conformance_suite {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn r1_run_at_defaults_to_now() {
                run_at_defaults_to_now(&*$make).await;
            }

            #[tokio::test]
            async fn r2_second_worker_finds_nothing() {
                second_worker_finds_nothing(&*$make).await;
            }

            #[tokio::test]
            async fn r3_never_reserves_future_or_failed() {
                never_reserves_future_or_failed(&*$make).await;
            }

            #[tokio::test]
            async fn r4_preference_order_wins() {
                preference_order_wins(&*$make).await;
            }

            #[tokio::test]
            async fn r5_wildcard_is_fallback() {
                wildcard_is_fallback(&*$make).await;
            }

            #[tokio::test]
            async fn r6_named_queue_skips_unqueued() {
                named_queue_skips_unqueued(&*$make).await;
            }

            #[tokio::test]
            async fn r7_stale_lock_rules() {
                stale_lock_rules(&*$make).await;
            }

            #[tokio::test]
            async fn r8_priority_orders_within_queue() {
                priority_orders_within_queue(&*$make).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn r9_at_most_one_claimant() {
                at_most_one_claimant($make).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn r10_many_workers_drain_many_jobs() {
                many_workers_drain_many_jobs($make).await;
            }

            #[tokio::test]
            async fn r11_lost_batch_queries_again() {
                lost_batch_queries_again($make).await;
            }

            #[tokio::test]
            async fn r12_exhausted_entry_falls_through() {
                exhausted_entry_falls_through($make).await;
            }
        }
    };
}

async fn memory_store() -> Arc<dyn JobStore> {
    Arc::new(MemoryStore::new())
}

conformance_suite!(memory, memory_store().await);

#[cfg(feature = "sqlite")]
async fn sqlite_store() -> Arc<dyn JobStore> {
    Arc::new(tardy_queue::SqliteStore::connect("sqlite::memory:").await.unwrap())
}

#[cfg(feature = "sqlite")]
conformance_suite!(sqlite, sqlite_store().await);

#[test]
fn wildcard_parses() {
    assert_eq!("*".parse::<QueueFilter>().unwrap(), QueueFilter::Any);
}
