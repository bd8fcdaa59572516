use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::{
    backend::JobStore,
    config::WorkerConfig,
    execution::{WorkSummary, Worker},
    job::{JobRegistry, JobType},
    observability::LiveMetrics,
    reservation::reserve,
    types::SlotId,
    JobRecord, NewJob, QueueResult, WorkerIdentity,
};

/// Placement of a job at enqueue time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    /// Falls back to the configured default priority
    pub priority: Option<i32>,
    /// Falls back to the store's current time
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Entry point for producers and in-process consumers of the queue
#[derive(Clone)]
pub struct QueueAdapter {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    metrics: Arc<LiveMetrics>,
}

impl QueueAdapter {
    /// Create a new queue adapter with default configuration
    pub fn new(store: impl JobStore + 'static, registry: JobRegistry) -> Self {
        Self::with_config(Arc::new(store), Arc::new(registry), WorkerConfig::default())
    }

    /// Create adapter with custom configuration
    pub fn with_config(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Share a metrics sink with other components
    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Enqueue a typed job with default placement
    pub async fn enqueue<J: JobType>(&self, job: &J) -> QueueResult<JobRecord> {
        self.enqueue_with(job, EnqueueOptions::default()).await
    }

    /// Enqueue a typed job
    #[instrument(skip(self, job, options), fields(job_type = J::JOB_TYPE))]
    pub async fn enqueue_with<J: JobType>(&self, job: &J, options: EnqueueOptions) -> QueueResult<JobRecord> {
        let payload = self.registry.encode(job)?;
        self.create(payload, J::JOB_TYPE, options).await
    }

    /// Enqueue already encoded payload text.
    ///
    /// The payload must name a registered job type with decodable arguments;
    /// otherwise nothing is persisted and `InvalidPayload` is returned.
    #[instrument(skip(self, payload, options))]
    pub async fn enqueue_payload(&self, payload: impl Into<String>, options: EnqueueOptions) -> QueueResult<JobRecord> {
        let payload = payload.into();
        let job_type = self.registry.validate(&payload)?;
        self.create(payload, &job_type, options).await
    }

    async fn create(&self, payload: String, job_type: &str, options: EnqueueOptions) -> QueueResult<JobRecord> {
        let mut new_job = NewJob::new(payload).with_priority(options.priority.unwrap_or(self.config.default_priority));
        new_job.queue = options.queue;
        new_job.run_at = options.run_at;

        let record = self.store.create(new_job).await?;
        self.metrics.record_enqueued(job_type);
        info!(job_id = %record.id, queue = ?record.queue, priority = record.priority, "Enqueued {}", job_type);
        Ok(record)
    }

    /// Claim the next job for `worker`
    pub async fn reserve(&self, worker: &WorkerIdentity) -> QueueResult<Option<JobRecord>> {
        reserve(self.store.as_ref(), worker, self.config.max_run_time).await
    }

    /// Lifecycle runner for `identity`, sharing this adapter's store, registry and metrics
    pub fn worker(&self, identity: WorkerIdentity) -> Worker {
        Worker::new(self.store.clone(), self.registry.clone(), self.config.clone(), identity)
            .with_metrics(self.metrics.clone())
    }

    /// Run up to `limit` jobs in this process with the configured queue filters
    pub async fn work_off(&self, limit: usize) -> QueueResult<WorkSummary> {
        self.worker(self.config.identity_for_slot(SlotId(0))).work_off(limit).await
    }

    /// Number of stored jobs, failed rows included
    pub async fn count(&self) -> QueueResult<u64> {
        self.store.count().await
    }

    /// Delete every job
    pub async fn clear(&self) -> QueueResult<u64> {
        let removed = self.store.delete_all().await?;
        info!(removed, "cleared queue");
        Ok(removed)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::{Job, JobError, QueueError};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct TestJob {
        data: String,
    }

    #[async_trait]
    impl Job for TestJob {
        async fn perform(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    impl JobType for TestJob {
        const JOB_TYPE: &'static str = "test_job";
    }

    fn adapter() -> QueueAdapter {
        QueueAdapter::new(MemoryStore::new(), JobRegistry::new().with::<TestJob>().unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_job() {
        let adapter = adapter();
        let record = adapter
            .enqueue_with(&TestJob { data: "test".into() }, EnqueueOptions::new().queue("mail").priority(2))
            .await
            .unwrap();

        assert_eq!(record.queue.as_deref(), Some("mail"));
        assert_eq!(record.priority, 2);
        assert_eq!(record.name(adapter.registry()), "test_job");
        assert_eq!(adapter.metrics().jobs_enqueued(), 1);
    }

    #[tokio::test]
    async fn test_default_priority_comes_from_config() {
        let config = WorkerConfig {
            default_priority: 7,
            ..WorkerConfig::default()
        };
        let registry = JobRegistry::new().with::<TestJob>().unwrap();
        let adapter = QueueAdapter::with_config(Arc::new(MemoryStore::new()), Arc::new(registry), config);

        let record = adapter.enqueue(&TestJob { data: "x".into() }).await.unwrap();
        assert_eq!(record.priority, 7);
    }

    #[tokio::test]
    async fn test_enqueue_payload_rejects_unknown_job_type() {
        let adapter = adapter();
        let result = adapter
            .enqueue_payload(r#"{"job_type":"nope","args":{}}"#, EnqueueOptions::new())
            .await;

        assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
        assert_eq!(adapter.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_work_off_drains_queue() {
        let adapter = adapter();
        for i in 0..3 {
            adapter.enqueue(&TestJob { data: i.to_string() }).await.unwrap();
        }

        let summary = adapter.work_off(10).await.unwrap();
        assert_eq!(summary, WorkSummary { succeeded: 3, failed: 0 });
        assert_eq!(adapter.count().await.unwrap(), 0);
        assert_eq!(adapter.metrics().jobs_completed(), 3);
    }
}
