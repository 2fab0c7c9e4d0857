//! Core job and item types with their state machines.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docuflow_core::{DomainError, ItemId, JobId, OwnerId};

/// Kind of long-running operation a job tracks.
///
/// Closed enum on purpose: handlers, lock keys, and fan-out policy are all
/// matched exhaustively against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobNamespace {
    /// AI categorization of uploaded documents (one item per file).
    DocumentCategorization,
    /// OCR extraction over uploaded documents (one item per file).
    Ocr,
    /// Bulk import of records from an uploaded file (one item per chunk).
    BulkImport,
    /// Bulk export to a downloadable file (single-shot).
    BulkExport,
    /// Full backup archive generation (single-shot).
    Backup,
    /// Invoice PDF generation (single-shot).
    InvoiceGeneration,
}

impl JobNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobNamespace::DocumentCategorization => "document_categorization",
            JobNamespace::Ocr => "ocr",
            JobNamespace::BulkImport => "bulk_import",
            JobNamespace::BulkExport => "bulk_export",
            JobNamespace::Backup => "backup",
            JobNamespace::InvoiceGeneration => "invoice_generation",
        }
    }

    /// Whether jobs of this kind fan out into per-unit items.
    ///
    /// Single-shot kinds have `total_units == 0` and are finished by the
    /// worker via `mark_job_terminal`, not the aggregator.
    pub fn is_fan_out(&self) -> bool {
        matches!(
            self,
            JobNamespace::DocumentCategorization | JobNamespace::Ocr | JobNamespace::BulkImport
        )
    }
}

impl core::fmt::Display for JobNamespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobNamespace {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_categorization" => Ok(JobNamespace::DocumentCategorization),
            "ocr" => Ok(JobNamespace::Ocr),
            "bulk_import" => Ok(JobNamespace::BulkImport),
            "bulk_export" => Ok(JobNamespace::BulkExport),
            "backup" => Ok(JobNamespace::Backup),
            "invoice_generation" => Ok(JobNamespace::InvoiceGeneration),
            other => Err(DomainError::validation(format!(
                "unknown job namespace: {other}"
            ))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no unit has started yet.
    Queued,
    /// At least one unit has started.
    Processing,
    /// All units finished, at least one successfully (or single-shot success).
    Completed,
    /// All units finished and every one of them errored (or single-shot failure).
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses that count as "inflight" for the dedup check.
    pub const INFLIGHT: &'static [JobStatus] = &[JobStatus::Queued, JobStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Item execution status.
///
/// Monotonic: `Queued → Processing → DoneSuccess | DoneError`. A retry must
/// re-enter through the task-item lock, never by rewinding the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    DoneSuccess,
    DoneError,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::DoneSuccess | ItemStatus::DoneError)
    }

    /// Forward-only transition check.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        match (self, next) {
            (ItemStatus::Queued, ItemStatus::Processing) => true,
            (ItemStatus::Processing, ItemStatus::DoneSuccess) => true,
            (ItemStatus::Processing, ItemStatus::DoneError) => true,
            _ => false,
        }
    }
}

/// Parent record of one triggered background operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: JobNamespace,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    /// 0–100, derived from the item tally (or forced by `mark_job_terminal`).
    pub progress: u8,
    pub total_units: u32,
    pub processed_units: u32,
    pub success_count: u32,
    pub error_count: u32,
    /// Structured payload written on completion (paths, summaries).
    pub result: Option<serde_json::Value>,
    /// Populated only on `Failed`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(namespace: JobNamespace, owner_id: OwnerId, total_units: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            namespace,
            owner_id,
            status: JobStatus::Queued,
            progress: 0,
            total_units,
            processed_units: 0,
            success_count: 0,
            error_count: 0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Specification for one unit of fan-out work, supplied at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSpec {
    /// Human-readable label for client progress display (e.g. a filename).
    pub label: String,
    /// Namespace-specific parameters handed to the worker.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One unit of fan-out work belonging to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub job_id: JobId,
    /// Stable ordering for client-side progress display.
    pub sort_index: u32,
    pub label: String,
    pub payload: serde_json::Value,
    pub status: ItemStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(job_id: JobId, sort_index: u32, spec: ItemSpec) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new(),
            job_id,
            sort_index,
            label: spec.label,
            payload: spec.payload,
            status: ItemStatus::Queued,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}
