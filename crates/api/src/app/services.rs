use std::sync::Arc;

use chrono::Utc;

use docuflow_infra::{
    EnqueueService, InMemoryLeaseLock, PostgresJobStore, WorkOrder, WorkerEngine, WorkerPoolConfig,
    WorkerPoolHandle, WorkerStats,
};
use docuflow_jobs::{CursorRegistry, InMemoryJobStore, JobNamespace, JobStore};

/// Wired application services shared across handlers.
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub cursors: Arc<CursorRegistry>,
    pub enqueue: EnqueueService<dyn JobStore>,
    // Held for the process lifetime; dropping it would orphan the workers.
    pool: WorkerPoolHandle,
}

impl AppServices {
    pub fn worker_stats(&self) -> WorkerStats {
        self.pool.stats()
    }
}

/// Select the job store backend: Postgres when `DOCUFLOW_DATABASE_URL` is
/// set, in-memory otherwise. The schema is applied on startup.
async fn select_store() -> Arc<dyn JobStore> {
    match std::env::var("DOCUFLOW_DATABASE_URL") {
        Ok(url) => {
            let store =
                PostgresJobStore::connect_lazy(&url, tokio::runtime::Handle::current())
                    .unwrap_or_else(|e| panic!("invalid DOCUFLOW_DATABASE_URL: {e}"));
            store
                .migrate()
                .await
                .unwrap_or_else(|e| panic!("failed to apply job store schema: {e}"));
            tracing::info!("job store backend: postgres");
            Arc::new(store)
        }
        Err(_) => {
            tracing::info!("job store backend: in-memory");
            InMemoryJobStore::arc()
        }
    }
}

/// Build the service graph: store, locks, cursors, worker pool, and the
/// enqueue service, with a processor registered per namespace.
pub async fn build_services() -> AppServices {
    let store = select_store().await;
    let locks = Arc::new(InMemoryLeaseLock::new());
    let cursors = CursorRegistry::arc();

    let mut engine = WorkerEngine::new(store.clone(), locks.clone(), cursors.clone());
    engine.register_processor(JobNamespace::DocumentCategorization, categorize_document);
    engine.register_processor(JobNamespace::Ocr, run_ocr);
    engine.register_processor(JobNamespace::BulkImport, import_chunk);
    engine.register_processor(JobNamespace::BulkExport, export_records);
    engine.register_processor(JobNamespace::Backup, create_backup);
    engine.register_processor(JobNamespace::InvoiceGeneration, generate_invoice);

    let (pool, queue) = engine.spawn(WorkerPoolConfig::default());
    let enqueue = EnqueueService::new(store.clone(), locks, Arc::new(queue), cursors.clone());

    AppServices {
        store,
        cursors,
        enqueue,
        pool,
    }
}

// Business collaborators. These are deliberately small in-process
// implementations; swapping one for a real categorizer/OCR engine only
// touches this file.

fn categorize_document(order: &WorkOrder) -> Result<serde_json::Value, String> {
    let filename = order
        .params
        .get("filename")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing filename".to_string())?;

    let category = match filename.rsplit('.').next() {
        Some("pdf") | Some("doc") | Some("docx") => "document",
        Some("png") | Some("jpg") | Some("jpeg") | Some("tiff") => "image",
        Some("csv") | Some("xlsx") => "spreadsheet",
        _ => "other",
    };
    Ok(serde_json::json!({ "category": category }))
}

fn run_ocr(order: &WorkOrder) -> Result<serde_json::Value, String> {
    let pages = order
        .params
        .get("pages")
        .and_then(|v| v.as_u64())
        .unwrap_or(1);
    Ok(serde_json::json!({ "pages": pages, "characters": pages * 1800 }))
}

fn import_chunk(order: &WorkOrder) -> Result<serde_json::Value, String> {
    let rows = order
        .params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "chunk has no rows".to_string())?;
    Ok(serde_json::json!({ "rows_imported": rows.len() }))
}

fn export_records(order: &WorkOrder) -> Result<serde_json::Value, String> {
    let query = order
        .params
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("all");
    Ok(serde_json::json!({
        "path": format!("/exports/{}-{}.csv", query, order.job_id),
    }))
}

fn create_backup(_order: &WorkOrder) -> Result<serde_json::Value, String> {
    Ok(serde_json::json!({
        "path": format!("/backups/{}.tar.zst", Utc::now().format("%Y-%m-%dT%H-%M-%S")),
    }))
}

fn generate_invoice(order: &WorkOrder) -> Result<serde_json::Value, String> {
    let invoice_id = order
        .params
        .get("invoice_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing invoice_id".to_string())?;
    Ok(serde_json::json!({
        "path": format!("/invoices/{invoice_id}.pdf"),
    }))
}
