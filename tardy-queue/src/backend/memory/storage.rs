use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::{
    backend::{CandidateQuery, JobStore},
    types::Eligibility,
    JobId, JobRecord, NewJob, QueueError, QueueResult,
};

/// In-memory store for testing, development and task-isolated pools
#[derive(Clone)]
pub struct MemoryStore {
    /// Job records indexed by id
    pub(crate) jobs: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,

    /// Id sequence
    next_id: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Snapshot of every stored record, ordered by id
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.jobs.read().values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: NewJob) -> QueueResult<JobRecord> {
        let now = Utc::now();
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let record = JobRecord {
            id,
            queue: job.queue,
            priority: job.priority,
            payload: job.payload,
            attempts: job.attempts,
            last_error: None,
            run_at: job.run_at.unwrap_or(now),
            locked_at: job.locked_at,
            locked_by: job.locked_by,
            failed_at: job.failed_at,
            created_at: now,
            updated_at: now,
        };

        self.jobs.write().insert(id, record.clone());
        Ok(record)
    }

    async fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn candidates(&self, query: &CandidateQuery<'_>) -> QueueResult<Vec<JobRecord>> {
        let jobs = self.jobs.read();
        let mut candidates: Vec<JobRecord> = jobs.values().filter(|r| query.matches(r)).cloned().collect();

        // Ties fall back to id so the order is total and stable
        candidates.sort_by_key(|r| (r.priority, r.run_at, r.id));
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn claim(&self, id: JobId, eligibility: &Eligibility<'_>) -> QueueResult<Option<JobRecord>> {
        let mut jobs = self.jobs.write();
        let Some(record) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        // Re-check under the write lock: another worker may have claimed it since selection
        if !eligibility.admits(record) {
            return Ok(None);
        }

        record.lock(eligibility.worker_name, eligibility.now);
        Ok(Some(record.clone()))
    }

    async fn update(&self, record: &JobRecord) -> QueueResult<()> {
        let mut jobs = self.jobs.write();
        let stored = jobs
            .get_mut(&record.id)
            .ok_or_else(|| QueueError::JobNotFound(record.id.to_string()))?;

        stored.queue = record.queue.clone();
        stored.priority = record.priority;
        stored.attempts = record.attempts;
        stored.last_error = record.last_error.clone();
        stored.run_at = record.run_at;
        stored.locked_at = record.locked_at;
        stored.locked_by = record.locked_by.clone();
        stored.failed_at = record.failed_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: JobId) -> QueueResult<bool> {
        Ok(self.jobs.write().remove(&id).is_some())
    }

    async fn clear_locks(&self, worker_name: &str) -> QueueResult<u64> {
        let mut cleared = 0;
        for record in self.jobs.write().values_mut() {
            if record.locked_by.as_deref() == Some(worker_name) {
                record.unlock();
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn count(&self) -> QueueResult<u64> {
        Ok(self.jobs.read().len() as u64)
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let mut jobs = self.jobs.write();
        let removed = jobs.len() as u64;
        jobs.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriorityRange, QueueFilter};
    use std::time::Duration;

    const MAX_RUN_TIME: Duration = Duration::from_secs(120);

    fn query<'a>(eligibility: Eligibility<'a>, queue: &'a QueueFilter) -> CandidateQuery<'a> {
        CandidateQuery {
            eligibility,
            queue,
            priority_range: PriorityRange::default(),
            limit: 10,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_run_at() {
        let store = MemoryStore::new();
        let first = store.create(NewJob::new("{}")).await.unwrap();
        let second = store.create(NewJob::new("{}")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(first.run_at <= Utc::now());
        assert_eq!(first.attempts, 0);
        assert!(first.queue.is_none());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_priority_then_run_at() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let late = store
            .create(NewJob::new("{}").with_run_at(now - chrono::Duration::seconds(10)))
            .await
            .unwrap();
        let early = store
            .create(NewJob::new("{}").with_run_at(now - chrono::Duration::seconds(20)))
            .await
            .unwrap();
        let urgent = store.create(NewJob::new("{}").with_priority(-5).with_run_at(now)).await.unwrap();

        let any = QueueFilter::Any;
        let found = store
            .candidates(&query(Eligibility::new(Utc::now(), MAX_RUN_TIME, "w"), &any))
            .await
            .unwrap();
        let ids: Vec<JobId> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![urgent.id, early.id, late.id]);
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = MemoryStore::new();
        let job = store.create(NewJob::new("{}")).await.unwrap();
        let now = Utc::now();

        let first = store.claim(job.id, &Eligibility::new(now, MAX_RUN_TIME, "a")).await.unwrap();
        assert_eq!(first.unwrap().locked_by.as_deref(), Some("a"));

        let second = store.claim(job.id, &Eligibility::new(now, MAX_RUN_TIME, "b")).await.unwrap();
        assert!(second.is_none());

        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.locked_by.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_clear_locks_only_touches_named_worker() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mine = store.create(NewJob::new("{}").with_lock("worker1", now)).await.unwrap();
        let theirs = store.create(NewJob::new("{}").with_lock("worker2", now)).await.unwrap();

        assert_eq!(store.clear_locks("worker1").await.unwrap(), 1);
        assert!(!store.find(mine.id).await.unwrap().unwrap().is_locked());
        assert!(store.find(theirs.id).await.unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_row() {
        let store = MemoryStore::new();
        let job = store.create(NewJob::new("{}")).await.unwrap();
        let at = Utc::now();

        store.mark_failed(job.id, at).await.unwrap();
        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_at, Some(at));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let store = MemoryStore::new();
        let job = store.create(NewJob::new("{}")).await.unwrap();
        store.create(NewJob::new("{}")).await.unwrap();

        assert!(store.delete(job.id).await.unwrap());
        assert!(!store.delete(job.id).await.unwrap());
        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
