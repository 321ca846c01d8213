use chrono::Utc;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capacity::CapacityManager;
use crate::db::Database;
use crate::dispatcher;
use crate::error::CoreError;
use crate::models::{WorkerKind, WorkerRecord};
use crate::pipeline::Pipeline;
use crate::pool_manager::{mode_for_slot, read_allocation};

/// Heartbeats expire after this many seconds without a refresh, so a
/// worker that crashes disappears from the coordination store instead of
/// lingering as a false liveness signal.
const HEARTBEAT_TTL_SECS: u64 = 90;

/// One pool slot's worker loop: poll for a mode assignment, claim a job in
/// that mode, run it through the pipeline, repeat until shutdown.
pub struct Worker {
    pub id: String,
    slot: usize,
    pool_size: usize,
    poll_interval: Duration,
    db: Database,
    pipeline: Arc<Pipeline>,
    capacity: Arc<CapacityManager>,
    redis: redis::aio::ConnectionManager,
    started_at: chrono::DateTime<Utc>,
    /// Acquired once on worker start, released (directory and all
    /// contents removed) on drop irrespective of exit path -- normal,
    /// panic, or cooperative shutdown (spec §9 "per-worker scratch
    /// directories").
    scratch_dir: TempDir,
}

impl Worker {
    pub fn new(
        slot: usize,
        pool_size: usize,
        poll_interval: Duration,
        db: Database,
        pipeline: Arc<Pipeline>,
        capacity: Arc<CapacityManager>,
        redis: redis::aio::ConnectionManager,
        temp_dir_base: &str,
    ) -> Result<Self, CoreError> {
        let hostname = hostname::get().map(|h| h.to_string_lossy().to_string()).unwrap_or_else(|_| "unknown-host".to_string());
        let id = format!("{hostname}-{slot}-{}", Uuid::new_v4());
        let scratch_dir = tempfile::Builder::new()
            .prefix(&format!("ocr-worker-{slot}-"))
            .tempdir_in(temp_dir_base)
            .map_err(|e| CoreError::Storage(format!("failed to create scratch directory in {temp_dir_base}: {e}")))?;
        Ok(Self { id, slot, pool_size, poll_interval, db, pipeline, capacity, redis, started_at: Utc::now(), scratch_dir })
    }

    /// Refreshes this worker's liveness record in the coordination store.
    /// Best-effort: a failed heartbeat write degrades liveness visibility,
    /// not job processing.
    async fn heartbeat(&mut self, worker_kind: WorkerKind) {
        let (cpu, ram_mb) = worker_kind.resource_cost();
        let record = WorkerRecord {
            worker_id: self.id.clone(),
            worker_type: worker_kind,
            cpu,
            ram_mb,
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        };
        let Ok(payload) = serde_json::to_string(&record) else { return };
        let key = format!("ocr:workers:{}", self.id);
        if let Err(e) = self.redis.set_ex::<_, _, ()>(key, payload, HEARTBEAT_TTL_SECS).await {
            tracing::warn!(worker_id = %self.id, error = %e, "failed to write heartbeat (ignored)");
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.id, slot = self.slot, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let allocation = read_allocation(&mut self.redis, self.pool_size).await;
            let mode = mode_for_slot(&allocation, self.slot);
            let worker_kind = WorkerKind::from_mode(mode);
            self.heartbeat(worker_kind).await;

            self.capacity.refresh();
            let guard = match self.capacity.try_allocate_for(worker_kind) {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::debug!(worker_id = %self.id, error = %e, "capacity denied, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            };

            let Some(claimed) = dispatcher::claim_with_backoff(&self.db, mode, &self.id, self.poll_interval, &shutdown).await else {
                drop(guard);
                break;
            };

            let job_id = claimed.job.id;
            if let Err(e) = self.pipeline.process(&self.db, &claimed, self.scratch_dir.path()).await {
                tracing::error!(worker_id = %self.id, job_id = %job_id, error = %e, "job processing failed");
            }
            drop(guard);
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }
}
