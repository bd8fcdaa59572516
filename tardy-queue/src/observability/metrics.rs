use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

/// Live counters for jobs handled by this process
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_rescheduled: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retained: AtomicU64,

    /// Accumulated successful execution time in microseconds
    execution_micros: AtomicU64,

    // Per-job-type counters
    job_type_metrics: RwLock<HashMap<String, JobTypeMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, job_type: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.with_job_type(job_type, |m| m.enqueued += 1);
    }

    pub fn record_completed(&self, job_type: &str, runtime: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(runtime.as_micros()).unwrap_or(u64::MAX);
        self.execution_micros.fetch_add(micros, Ordering::Relaxed);
        self.with_job_type(job_type, |m| {
            m.completed += 1;
            m.total_runtime += runtime;
        });
    }

    pub fn record_rescheduled(&self, job_type: &str) {
        self.jobs_rescheduled.fetch_add(1, Ordering::Relaxed);
        self.with_job_type(job_type, |m| m.rescheduled += 1);
    }

    /// Record a permanent failure; `retained` when the row was kept with `failed_at`
    pub fn record_failed(&self, job_type: &str, retained: bool) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        if retained {
            self.jobs_retained.fetch_add(1, Ordering::Relaxed);
        }
        self.with_job_type(job_type, |m| m.failed += 1);
    }

    fn with_job_type(&self, job_type: &str, update: impl FnOnce(&mut JobTypeMetrics)) {
        let mut metrics = self.job_type_metrics.write();
        update(metrics.entry(job_type.to_string()).or_default());
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_rescheduled(&self) -> u64 {
        self.jobs_rescheduled.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retained(&self) -> u64 {
        self.jobs_retained.load(Ordering::Relaxed)
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_micros(self.execution_micros.load(Ordering::Relaxed))
    }

    /// Get metrics for a specific job type
    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_type_metrics.read().get(job_type).cloned()
    }

    /// Point-in-time copy of the global counters
    pub fn snapshot(&self) -> GlobalMetrics {
        GlobalMetrics {
            jobs_enqueued: self.jobs_enqueued(),
            jobs_completed: self.jobs_completed(),
            jobs_rescheduled: self.jobs_rescheduled(),
            jobs_failed: self.jobs_failed(),
            jobs_retained: self.jobs_retained(),
        }
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub rescheduled: u64,
    pub failed: u64,
    pub total_runtime: Duration,
}

impl JobTypeMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }

    pub fn average_runtime(&self) -> Option<Duration> {
        let completed = u32::try_from(self.completed).ok().filter(|c| *c > 0)?;
        Some(self.total_runtime / completed)
    }
}

/// Global queue metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalMetrics {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_failed: u64,
    pub jobs_retained: u64,
}

impl GlobalMetrics {
    /// Calculate overall success rate
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.jobs_completed + self.jobs_failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.jobs_completed as f64 / total_processed as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_metrics() {
        let metrics = LiveMetrics::new();

        metrics.record_enqueued("test_job");
        metrics.record_completed("test_job", Duration::from_millis(100));
        metrics.record_completed("test_job", Duration::from_millis(300));

        assert_eq!(metrics.jobs_enqueued(), 1);
        assert_eq!(metrics.jobs_completed(), 2);
        assert_eq!(metrics.execution_time(), Duration::from_millis(400));

        let job_metrics = metrics.job_type_metrics("test_job").unwrap();
        assert_eq!(job_metrics.completed, 2);
        assert_eq!(job_metrics.success_rate(), 100.0);
        assert_eq!(job_metrics.average_runtime(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_failures_split_by_disposition() {
        let metrics = LiveMetrics::new();
        metrics.record_rescheduled("mail");
        metrics.record_failed("mail", false);
        metrics.record_failed("mail", true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_rescheduled, 1);
        assert_eq!(snapshot.jobs_failed, 2);
        assert_eq!(snapshot.jobs_retained, 1);
        assert_eq!(snapshot.success_rate(), 0.0);
    }

    #[test]
    fn test_global_metrics() {
        let global = GlobalMetrics {
            jobs_enqueued: 100,
            jobs_completed: 80,
            jobs_rescheduled: 5,
            jobs_failed: 10,
            jobs_retained: 0,
        };

        assert_eq!(global.success_rate(), 88.88888888888889); // 80/(80+10) * 100
    }
}
