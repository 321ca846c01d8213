use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The kind of source document backing a queue row.
///
/// `plan_cadastraux` carries no OCR work of its own; it is modeled as a
/// closed variant (not a string) so dispatching on it is exhaustive rather
/// than a runtime string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    Index,
    Acte,
    PlanCadastraux,
}

impl DocumentSource {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DocumentSource::Index => "index",
            DocumentSource::Acte => "acte",
            DocumentSource::PlanCadastraux => "plan_cadastraux",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "index" => Some(DocumentSource::Index),
            "acte" => Some(DocumentSource::Acte),
            "plan_cadastraux" => Some(DocumentSource::PlanCadastraux),
            _ => None,
        }
    }

    /// The storage bucket this source is downloaded from.
    pub fn bucket(&self) -> &'static str {
        match self {
            DocumentSource::Index => "index",
            DocumentSource::Acte => "actes",
            DocumentSource::PlanCadastraux => "plans-cadastraux",
        }
    }
}

/// The worker mode a generic pool worker can be assigned. `plan_cadastraux`
/// jobs are skipped by the pipeline and never drive a pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Index,
    Acte,
}

impl WorkerMode {
    pub fn document_source(&self) -> DocumentSource {
        match self {
            WorkerMode::Index => DocumentSource::Index,
            WorkerMode::Acte => DocumentSource::Acte,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Index => "index",
            WorkerMode::Acte => "acte",
        }
    }
}

/// Numeric `status_id` values the core understands. Any other value found
/// in the row is a schema-compatibility concern, not handled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Complete = 3,
    Erreur = 4,
    ExtractionComplete = 5,
    OcrProcessing = 6,
}

impl JobStatus {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            3 => Some(JobStatus::Complete),
            4 => Some(JobStatus::Erreur),
            5 => Some(JobStatus::ExtractionComplete),
            6 => Some(JobStatus::OcrProcessing),
            _ => None,
        }
    }
}

/// A row in `extraction_queue`, as consumed by this core. Only the columns
/// this core reads and writes are modeled; the table may carry others.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub document_number: String,
    pub document_source: String,
    pub supabase_path: String,
    pub status_id: i32,
    pub ocr_worker_id: Option<String>,
    pub ocr_started_at: Option<DateTime<Utc>>,
    pub ocr_completed_at: Option<DateTime<Utc>>,
    pub ocr_attempts: i32,
    pub ocr_max_attempts: i32,
    pub ocr_error: Option<String>,
    pub ocr_last_error_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn document_source(&self) -> Option<DocumentSource> {
        DocumentSource::from_db_str(&self.document_source)
    }

    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_i32(self.status_id)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.ocr_attempts >= self.ocr_max_attempts
    }
}

/// One configured deployment environment. Each has its own database pool
/// and storage base, queried in the fixed priority order `Prod > Staging >
/// Dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    /// Fixed dispatch priority order, highest first.
    pub const PRIORITY_ORDER: [Environment; 3] =
        [Environment::Prod, Environment::Staging, Environment::Dev];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Staging => "staging",
            Environment::Dev => "dev",
        }
    }
}

/// Liveness + accounting record for one worker, kept in the coordination
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub worker_type: WorkerKind,
    pub cpu: f64,
    pub ram_mb: f64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Kinds of worker registered with the Capacity Manager. `Registre` is
/// carried over from the source's worker taxonomy even though the OCR core
/// only ever allocates `IndexOcr`/`ActeOcr` workers; any workers of the
/// third kind are simply never admitted by this core's pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    IndexOcr,
    ActeOcr,
    Registre,
}

impl WorkerKind {
    pub fn from_mode(mode: WorkerMode) -> Self {
        match mode {
            WorkerMode::Index => WorkerKind::IndexOcr,
            WorkerMode::Acte => WorkerKind::ActeOcr,
        }
    }

    /// Fixed (vCPU, RAM MB) admission cost for one worker of this kind,
    /// per §4.4. `Registre` workers are never allocated by this core, so
    /// its cost is nominal and exists only to keep the match exhaustive.
    pub fn resource_cost(&self) -> (f64, f64) {
        match self {
            WorkerKind::IndexOcr => (1.5, 768.0),
            WorkerKind::ActeOcr => (1.0, 512.0),
            WorkerKind::Registre => (1.0, 512.0),
        }
    }
}

/// Target allocation published by the Pool Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAllocation {
    pub index_workers: usize,
    pub acte_workers: usize,
}

impl PoolAllocation {
    pub fn total(&self) -> usize {
        self.index_workers + self.acte_workers
    }
}

/// Pending-job counts used to compute a `PoolAllocation`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueAnalysis {
    pub index_count: i64,
    pub acte_count: i64,
}

impl QueueAnalysis {
    pub fn total(&self) -> i64 {
        self.index_count + self.acte_count
    }

    /// Fraction of pending work that is `index`, defaulting to 0.5 when the
    /// queue is empty.
    pub fn index_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.5
        } else {
            self.index_count as f64 / total as f64
        }
    }
}
