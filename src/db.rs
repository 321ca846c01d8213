use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;
use crate::models::{DocumentSource, Environment, Job, JobStatus, QueueAnalysis};

/// One environment's database handle, plus a cached capability probe for
/// the `boosted_file_content` column, performed once at startup and cached
/// for the process lifetime instead of reacting to a provider-specific
/// error code on every write.
#[derive(Clone)]
pub struct EnvironmentDb {
    pub pool: PgPool,
    pub has_boosted_file_content: bool,
}

/// All configured environment database handles, keyed by [`Environment`].
#[derive(Clone)]
pub struct Database {
    envs: HashMap<Environment, EnvironmentDb>,
}

impl Database {
    pub async fn connect(config: &Config) -> Result<Self, CoreError> {
        let mut envs = HashMap::new();
        for env_kind in &config.enabled_environments {
            let env_cfg = &config.environments[env_kind];
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(600))
                .min_connections(1)
                .connect(&env_cfg.database_url)
                .await?;

            let has_boosted_file_content = probe_boosted_file_content_column(&pool).await?;
            if !has_boosted_file_content {
                tracing::warn!(
                    environment = env_kind.as_str(),
                    "boosted_file_content column absent, falling back to file_content-only updates"
                );
            }

            envs.insert(*env_kind, EnvironmentDb { pool, has_boosted_file_content });
        }
        Ok(Self { envs })
    }

    /// Builds a single-environment handle directly from an already-open
    /// pool, bypassing [`Config`]. Used by integration tests that stand up
    /// their own Postgres instance.
    pub async fn from_pool(env: Environment, pool: PgPool) -> Result<Self, CoreError> {
        let has_boosted_file_content = probe_boosted_file_content_column(&pool).await?;
        let mut envs = HashMap::new();
        envs.insert(env, EnvironmentDb { pool, has_boosted_file_content });
        Ok(Self { envs })
    }

    pub fn env(&self, env: Environment) -> &EnvironmentDb {
        &self.envs[&env]
    }

    /// The configured environments, in fixed dispatch priority order.
    /// Components that sweep "every environment" (dispatcher, pool
    /// analysis, stale monitor) iterate this instead of the full
    /// [`Environment::PRIORITY_ORDER`], since only enabled environments
    /// have an open connection.
    pub fn enabled_in_priority_order(&self) -> Vec<Environment> {
        Environment::PRIORITY_ORDER.into_iter().filter(|e| self.envs.contains_key(e)).collect()
    }

    /// Selects up to `limit` eligible candidates in one environment/mode,
    /// in `created_at` order, then attempts the atomic conditional claim on
    /// each in turn until one succeeds.
    pub async fn claim_next_job(
        &self,
        env: Environment,
        source: DocumentSource,
        worker_id: &str,
        limit: i64,
    ) -> Result<Option<Job>, CoreError> {
        let pool = &self.env(env).pool;

        let candidates: Vec<Uuid> = sqlx::query(
            r#"
            SELECT id FROM extraction_queue
            WHERE status_id = $1
              AND document_source = $2
              AND ocr_attempts < ocr_max_attempts
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(JobStatus::Complete.as_i32())
        .bind(source.as_db_str())
        .bind(limit)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<Uuid, _>("id"))
        .collect();

        for candidate_id in candidates {
            let claimed = sqlx::query_as::<_, Job>(
                r#"
                UPDATE extraction_queue
                SET status_id = $1,
                    ocr_worker_id = $2,
                    ocr_started_at = NOW(),
                    ocr_attempts = ocr_attempts + 1,
                    updated_at = NOW()
                WHERE id = $3 AND status_id = $4
                RETURNING id, document_number, document_source, supabase_path,
                          status_id, ocr_worker_id, ocr_started_at, ocr_completed_at,
                          ocr_attempts, ocr_max_attempts, ocr_error, ocr_last_error_at
                "#,
            )
            .bind(JobStatus::OcrProcessing.as_i32())
            .bind(worker_id)
            .bind(candidate_id)
            .bind(JobStatus::Complete.as_i32())
            .fetch_optional(pool)
            .await?;

            if let Some(job) = claimed {
                tracing::info!(job_id = %job.id, worker_id, environment = env.as_str(), "claimed job");
                return Ok(Some(job));
            }
            // Zero rows affected: another worker won the race. Not an
            // error -- try the next candidate.
        }

        Ok(None)
    }

    /// Persists the boosted (and optionally sanitised) text and
    /// transitions to `EXTRACTION_COMPLETE`.
    pub async fn mark_extraction_complete(
        &self,
        env: Environment,
        job_id: Uuid,
        file_content: &str,
        boosted_file_content: &str,
    ) -> Result<(), CoreError> {
        let env_db = self.env(env);

        if env_db.has_boosted_file_content {
            sqlx::query(
                r#"
                UPDATE extraction_queue
                SET status_id = $1,
                    file_content = $2,
                    boosted_file_content = $3,
                    ocr_completed_at = NOW(),
                    ocr_error = NULL,
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(JobStatus::ExtractionComplete.as_i32())
            .bind(file_content)
            .bind(boosted_file_content)
            .bind(job_id)
            .execute(&env_db.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE extraction_queue
                SET status_id = $1,
                    file_content = $2,
                    ocr_completed_at = NOW(),
                    ocr_error = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(JobStatus::ExtractionComplete.as_i32())
            .bind(file_content)
            .bind(job_id)
            .execute(&env_db.pool)
            .await?;
        }

        Ok(())
    }

    /// `plan_cadastraux` jobs complete without any provider calls and
    /// without `file_content`.
    pub async fn mark_skipped_complete(&self, env: Environment, job_id: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE extraction_queue
            SET status_id = $1,
                file_content = NULL,
                ocr_completed_at = NOW(),
                ocr_error = NULL,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(JobStatus::ExtractionComplete.as_i32())
        .bind(job_id)
        .execute(&self.env(env).pool)
        .await?;
        Ok(())
    }

    /// Records the error and either reverts to `COMPLETE` (recoverable) or
    /// transitions to `ERREUR` (exhausted). Never touches `file_content`.
    pub async fn mark_failed(
        &self,
        env: Environment,
        job_id: Uuid,
        attempts_exhausted: bool,
        error_message: &str,
    ) -> Result<(), CoreError> {
        let next_status = if attempts_exhausted {
            JobStatus::Erreur
        } else {
            JobStatus::Complete
        };

        sqlx::query(
            r#"
            UPDATE extraction_queue
            SET status_id = $1,
                ocr_worker_id = NULL,
                ocr_error = $2,
                ocr_last_error_at = NOW(),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(next_status.as_i32())
        .bind(error_message)
        .bind(job_id)
        .execute(&self.env(env).pool)
        .await?;

        Ok(())
    }

    /// Resets rows stranded in `OCR_PROCESSING` past the staleness
    /// threshold. Strictly-less-than on `ocr_started_at` -- a row exactly
    /// at the threshold is not reset.
    pub async fn recover_stale_jobs(&self, env: Environment, threshold: Duration) -> Result<u64, CoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE extraction_queue
            SET status_id = $1,
                ocr_worker_id = NULL,
                ocr_error = 'Reset by stale OCR monitor',
                ocr_last_error_at = NOW(),
                updated_at = NOW()
            WHERE status_id = $2
              AND ocr_started_at < $3
            "#,
        )
        .bind(JobStatus::Complete.as_i32())
        .bind(JobStatus::OcrProcessing.as_i32())
        .bind(cutoff)
        .execute(&self.env(env).pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(environment = env.as_str(), count = recovered, "recovered stale OCR jobs");
        }
        Ok(recovered)
    }

    /// Pending-job counts per document type, used by the Pool Manager to
    /// compute a target allocation.
    pub async fn analyse_queue(&self, env: Environment) -> Result<QueueAnalysis, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE document_source = 'index') AS index_count,
                COUNT(*) FILTER (WHERE document_source = 'acte') AS acte_count
            FROM extraction_queue
            WHERE status_id = $1
            "#,
        )
        .bind(JobStatus::Complete.as_i32())
        .fetch_one(&self.env(env).pool)
        .await?;

        Ok(QueueAnalysis {
            index_count: row.get::<Option<i64>, _>("index_count").unwrap_or(0),
            acte_count: row.get::<Option<i64>, _>("acte_count").unwrap_or(0),
        })
    }

    /// Maintenance helper: requeue `ERREUR` rows that still have attempt
    /// budget left, back to `COMPLETE`. Not driven by the worker critical
    /// path; an operational tool only.
    pub async fn requeue_failed(&self, env: Environment) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_queue
            SET status_id = $1,
                ocr_error = NULL
            WHERE status_id = $2
              AND ocr_attempts < ocr_max_attempts
            "#,
        )
        .bind(JobStatus::Complete.as_i32())
        .bind(JobStatus::Erreur.as_i32())
        .execute(&self.env(env).pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// One-time capability probe for the `boosted_file_content` column,
/// performed at startup and cached on [`EnvironmentDb`] for the process
/// lifetime.
async fn probe_boosted_file_content_column(pool: &PgPool) -> Result<bool, CoreError> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.columns
            WHERE table_name = 'extraction_queue' AND column_name = 'boosted_file_content'
        ) AS present
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(row.get::<bool, _>("present"))
}
