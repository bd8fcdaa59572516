use std::time::Duration;

use tracing::{debug, instrument};

use crate::{
    backend::{CandidateQuery, JobStore},
    types::Eligibility,
    JobRecord, QueueResult, WorkerIdentity,
};

/// Candidates fetched per query; an entry is re-queried until it has none left
pub const RESERVE_BATCH: usize = 5;

/// Claim the next job for `worker`.
///
/// Preference entries are tried in order and the first entry that yields a
/// successful claim wins, even if a later entry holds a more urgent job.
/// Inside an entry candidates are tried by priority then `run_at`; a lost
/// race moves on to the next candidate of the same entry. When a whole batch
/// is lost the entry is queried again, and only an empty result moves on to
/// the next entry.
#[instrument(skip(store, worker), fields(worker = %worker.name))]
pub async fn reserve<S>(store: &S, worker: &WorkerIdentity, max_run_time: Duration) -> QueueResult<Option<JobRecord>>
where
    S: JobStore + ?Sized,
{
    let now = store.current_time().await?;
    let eligibility = Eligibility::new(now, max_run_time, &worker.name);

    for entry in worker.preference_entries() {
        let query = CandidateQuery {
            eligibility,
            queue: &entry,
            priority_range: worker.priority_range,
            limit: RESERVE_BATCH,
        };

        loop {
            let candidates = store.candidates(&query).await?;
            if candidates.is_empty() {
                break;
            }

            for candidate in candidates {
                match store.claim(candidate.id, &eligibility).await? {
                    Some(claimed) => {
                        debug!(job_id = %claimed.id, queue = %entry, "reserved job");
                        return Ok(Some(claimed));
                    }
                    None => debug!(job_id = %candidate.id, "lost claim race"),
                }
            }
        }
    }

    Ok(None)
}
