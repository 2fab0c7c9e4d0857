use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docuflow_jobs::{Item, ItemSpec, ItemStatus, Job, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct TriggerJobRequest {
    /// Optional dedup scope (e.g. an export query hash).
    pub scope: Option<String>,
    /// Namespace-specific parameters for single-shot jobs.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Fan-out unit specs; required for fan-out namespaces.
    #[serde(default)]
    pub units: Vec<ItemSpec>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Client-facing view of a job; also the payload of job stream events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub namespace: String,
    pub status: JobStatus,
    pub progress: u8,
    pub total_units: u32,
    pub processed_units: u32,
    pub success_count: u32,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Fetch link for jobs whose result is a produced artifact (exports,
    /// backups, generated documents).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let download_url = job
            .result
            .as_ref()
            .and_then(|r| r.get("path"))
            .and_then(|p| p.as_str())
            .map(str::to_string);
        Self {
            job_id: job.id.to_string(),
            namespace: job.namespace.to_string(),
            status: job.status,
            progress: job.progress,
            total_units: job.total_units,
            processed_units: job.processed_units,
            success_count: job.success_count,
            error_count: job.error_count,
            result: job.result.clone(),
            error_message: job.error_message.clone(),
            download_url,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub item_id: String,
    pub sort_index: u32,
    pub label: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Item> for ItemView {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id.to_string(),
            sort_index: item.sort_index,
            label: item.label.clone(),
            status: item.status,
            result: item.result.clone(),
            error_message: item.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerJobResponse {
    #[serde(flatten)]
    pub job: JobView,
    pub queued: bool,
    pub deduplicated: bool,
    pub status_url: String,
    pub stream_url: String,
}

impl TriggerJobResponse {
    pub fn new(job: &Job, queued: bool, deduplicated: bool) -> Self {
        Self {
            job: JobView::from(job),
            queued,
            deduplicated,
            status_url: format!("/jobs/{}", job.id),
            stream_url: format!("/jobs/{}/stream", job.id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobView,
    pub units: Vec<ItemView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docuflow_core::OwnerId;
    use docuflow_jobs::JobNamespace;

    #[test]
    fn download_url_surfaces_the_result_path() {
        let mut job = Job::new(JobNamespace::Backup, OwnerId::new(), 0);
        assert!(JobView::from(&job).download_url.is_none());

        job.result = Some(serde_json::json!({"path": "/backups/nightly.tar.zst"}));
        let view = JobView::from(&job);
        assert_eq!(view.download_url.as_deref(), Some("/backups/nightly.tar.zst"));

        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["download_url"], "/backups/nightly.tar.zst");
    }

    #[test]
    fn pathless_results_carry_no_download_url() {
        let mut job = Job::new(JobNamespace::Ocr, OwnerId::new(), 2);
        job.result = Some(serde_json::json!({"characters": 3600}));
        let view = JobView::from(&job);
        assert!(view.download_url.is_none());

        let body = serde_json::to_value(&view).unwrap();
        assert!(body.get("download_url").is_none());
    }
}
