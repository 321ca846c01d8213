use std::time::Duration;
use tokio::time::sleep;

use crate::db::Database;
use crate::error::CoreError;
use crate::models::{Environment, Job, WorkerMode};

const CLAIM_CANDIDATE_LIMIT: i64 = 10;

/// One claimed job, tagged with the environment it was claimed from --
/// every downstream operation (completion, failure, recovery) must target
/// the same environment's database.
pub struct ClaimedJob {
    pub environment: Environment,
    pub job: Job,
}

/// Walks the configured environments in priority order, attempting a claim
/// in each until one succeeds, returning `None` if every environment is
/// currently empty of eligible work for `mode`.
pub async fn try_claim(db: &Database, mode: WorkerMode, worker_id: &str) -> Result<Option<ClaimedJob>, CoreError> {
    for env in db.enabled_in_priority_order() {
        if let Some(job) = db
            .claim_next_job(env, mode.document_source(), worker_id, CLAIM_CANDIDATE_LIMIT)
            .await?
        {
            return Ok(Some(ClaimedJob { environment: env, job }));
        }
    }
    Ok(None)
}

/// Claims a job, sleeping `poll_interval` and retrying if every environment
/// came up empty, until one is found or `shutdown` fires.
pub async fn claim_with_backoff(
    db: &Database,
    mode: WorkerMode,
    worker_id: &str,
    poll_interval: Duration,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Option<ClaimedJob> {
    loop {
        match try_claim(db, mode, worker_id).await {
            Ok(Some(claimed)) => return Some(claimed),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, worker_id, "claim attempt failed"),
        }

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = shutdown.cancelled() => return None,
        }
    }
}
