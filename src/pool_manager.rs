use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::db::Database;
use crate::error::CoreError;
use crate::models::{PoolAllocation, QueueAnalysis, WorkerMode};

const ALLOCATION_KEY: &str = "ocr:pool:allocation";

/// Periodically recomputes how many of the fixed pool size should run in
/// `index` vs. `acte` mode and publishes the result to the coordination
/// store for workers to pick up on their next mode-assignment poll.
pub struct PoolManager {
    db: Database,
    conn: ConnectionManager,
    config: PoolConfig,
}

impl PoolManager {
    pub async fn new(db: Database, redis_url: &str, config: PoolConfig) -> Result<Self, CoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| CoreError::RateLimiter(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::RateLimiter(e.to_string()))?;
        Ok(Self { db, conn, config })
    }

    async fn publish(&mut self, allocation: &PoolAllocation) -> Result<(), CoreError> {
        let payload = serde_json::to_string(allocation)
            .map_err(|e| CoreError::RateLimiter(format!("failed to serialise pool allocation: {e}")))?;
        self.conn
            .set::<_, _, ()>(ALLOCATION_KEY, payload)
            .await
            .map_err(|e| CoreError::RateLimiter(e.to_string()))?;
        Ok(())
    }

    async fn rebalance_once(&mut self) -> Result<PoolAllocation, CoreError> {
        let mut combined = QueueAnalysis::default();
        for env in self.db.enabled_in_priority_order() {
            if let Ok(analysis) = self.db.analyse_queue(env).await {
                combined.index_count += analysis.index_count;
                combined.acte_count += analysis.acte_count;
            }
        }

        let allocation = compute_allocation(&self.config, combined);
        self.publish(&allocation).await?;
        tracing::info!(
            index_workers = allocation.index_workers,
            acte_workers = allocation.acte_workers,
            pending_index = combined.index_count,
            pending_acte = combined.acte_count,
            "rebalanced pool allocation"
        );
        Ok(allocation)
    }

    /// Runs the rebalance loop until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.rebalance_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance_once().await {
                        tracing::error!(error = %e, "pool rebalance failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("pool manager shutting down");
                    break;
                }
            }
        }
    }
}

/// Computes the target split, honoring the configured per-mode minimums
/// first and distributing the remainder by queue ratio.
pub fn compute_allocation(config: &PoolConfig, analysis: QueueAnalysis) -> PoolAllocation {
    let size = config.size;

    let (raw_index, raw_acte) = if analysis.total() == 0 {
        (size / 2, size - size / 2)
    } else {
        let index = (size as f64 * analysis.index_ratio()).round() as usize;
        let index = index.min(size);
        (index, size - index)
    };

    let min_index = config.min_index.min(size);
    let min_acte = config.min_acte.min(size.saturating_sub(min_index));

    let index_workers = raw_index.max(min_index);
    let acte_workers = size.saturating_sub(index_workers).max(min_acte);
    let index_workers = size.saturating_sub(acte_workers);

    PoolAllocation { index_workers, acte_workers }
}

/// Reads the last-published allocation from the coordination store. Used
/// by workers polling for their current mode assignment; defaults to an
/// even split if nothing has been published yet (a cold-started pool).
pub async fn read_allocation(conn: &mut ConnectionManager, pool_size: usize) -> PoolAllocation {
    let raw: Option<String> = conn.get(ALLOCATION_KEY).await.ok().flatten();
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_else(|| {
        let acte_workers = pool_size / 2;
        PoolAllocation { index_workers: pool_size - acte_workers, acte_workers }
    })
}

pub fn mode_for_slot(allocation: &PoolAllocation, slot: usize) -> WorkerMode {
    if slot < allocation.index_workers {
        WorkerMode::Index
    } else {
        WorkerMode::Acte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig { size: 10, min_index: 1, min_acte: 1, rebalance_interval: Duration::from_secs(30) }
    }

    #[test]
    fn allocation_respects_minimums_on_empty_queue() {
        let allocation = compute_allocation(&config(), QueueAnalysis::default());
        assert_eq!(allocation.index_workers + allocation.acte_workers, 10);
        assert!(allocation.index_workers >= 1);
        assert!(allocation.acte_workers >= 1);
    }

    #[test]
    fn allocation_skews_toward_larger_queue() {
        let analysis = QueueAnalysis { index_count: 90, acte_count: 10 };
        let allocation = compute_allocation(&config(), analysis);
        assert!(allocation.index_workers > allocation.acte_workers);
    }

    #[test]
    fn allocation_covers_full_pool_size_regardless_of_ratio() {
        let analysis = QueueAnalysis { index_count: 1, acte_count: 0 };
        let allocation = compute_allocation(&config(), analysis);
        assert_eq!(allocation.total(), 10);
    }
}
