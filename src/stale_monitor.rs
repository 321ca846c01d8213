use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::StaleConfig;
use crate::db::Database;

/// Periodically sweeps every configured environment for rows stranded in
/// `OCR_PROCESSING` past the staleness threshold -- a worker that crashed
/// or was killed mid-job leaves its claim behind otherwise.
pub struct StaleMonitor {
    db: Database,
    config: StaleConfig,
}

impl StaleMonitor {
    pub fn new(db: Database, config: StaleConfig) -> Self {
        Self { db, config }
    }

    async fn sweep_once(&self) {
        for env in self.db.enabled_in_priority_order() {
            match self.db.recover_stale_jobs(env, self.config.threshold).await {
                Ok(_) => {}
                Err(e) => tracing::error!(environment = env.as_str(), error = %e, "stale sweep failed"),
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                _ = shutdown.cancelled() => {
                    tracing::info!("stale monitor shutting down");
                    break;
                }
            }
        }
    }
}
