//! Durable task queue.
//!
//! A table-backed queue with at-least-once delivery. Tasks are structured
//! records (kind + JSON payload), never serialized closures. Workers claim
//! with `FOR UPDATE SKIP LOCKED` and hold a lease; a worker that dies simply
//! lets its lease expire and the task is redelivered, which is safe because
//! every stage gates on `current_step` before doing work.
//!
//! Task kinds:
//!
//! | kind | payload |
//! |------|---------|
//! | `ingest_folder` | `{folder_id, options}` |
//! | `run_full_pipeline` | `{document_id}` |
//! | `reprocess_document` | `{document_id, from_step}` |
//! | `rebuild_hnsw_index` | `{}` |
//!
//! The queue is the single authority for task state
//! (`PENDING|STARTED|PROGRESS|SUCCESS|FAILURE|REVOKED`); callers poll by
//! task id. Progress is written at stage boundaries and per embed batch.

use anyhow::Result;
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::StageResult;
use crate::ingest::ScanOptions;
use crate::pipeline::RunOutcome;

pub const KIND_INGEST_FOLDER: &str = "ingest_folder";
pub const KIND_RUN_FULL_PIPELINE: &str = "run_full_pipeline";
pub const KIND_REPROCESS_DOCUMENT: &str = "reprocess_document";
pub const KIND_REBUILD_HNSW: &str = "rebuild_hnsw_index";

/// Redeliveries before a task is declared failed.
const MAX_ATTEMPTS: i32 = 5;

/// Snapshot of one task row, shaped for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub state: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A claimed task's write handle: progress updates and cancellation checks
/// go through this, keeping the task row the single source of truth.
#[derive(Clone)]
pub struct TaskHandle {
    pub id: Uuid,
    pool: PgPool,
}

impl TaskHandle {
    pub async fn set_progress(&self, progress: i32, step: &str) -> StageResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET progress = $2, step = $3, state = 'PROGRESS', updated_at = now()
            WHERE id = $1 AND state IN ('STARTED', 'PROGRESS')
            "#,
        )
        .bind(self.id)
        .bind(progress.clamp(0, 100))
        .bind(step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self) -> StageResult<bool> {
        let cancelled: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM tasks WHERE id = $1")
                .bind(self.id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cancelled.unwrap_or(true))
    }
}

// ============ Enqueue / inspect / revoke ============

pub async fn enqueue(pool: &PgPool, kind: &str, payload: serde_json::Value) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tasks (id, kind, payload) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(kind)
        .bind(&payload)
        .execute(pool)
        .await?;
    Ok(id)
}

pub async fn enqueue_ingest_folder(
    pool: &PgPool,
    folder_id: &str,
    options: &ScanOptions,
) -> Result<Uuid> {
    enqueue(
        pool,
        KIND_INGEST_FOLDER,
        serde_json::json!({ "folder_id": folder_id, "options": options }),
    )
    .await
}

pub async fn enqueue_pipeline(pool: &PgPool, document_id: Uuid) -> Result<Uuid> {
    enqueue(
        pool,
        KIND_RUN_FULL_PIPELINE,
        serde_json::json!({ "document_id": document_id }),
    )
    .await
}

pub async fn enqueue_reprocess(pool: &PgPool, document_id: Uuid, from_step: i32) -> Result<Uuid> {
    enqueue(
        pool,
        KIND_REPROCESS_DOCUMENT,
        serde_json::json!({ "document_id": document_id, "from_step": from_step }),
    )
    .await
}

pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskStatus>> {
    let row = sqlx::query(
        "SELECT id, state, progress, step, result, error FROM tasks WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| TaskStatus {
        task_id: r.get("id"),
        state: r.get("state"),
        progress: r.get("progress"),
        step: r.get("step"),
        result: r.get("result"),
        error: r.get("error"),
    }))
}

/// Request cancellation. Idempotent; a task that never started flips to
/// REVOKED immediately, a running one is revoked at its next checkpoint.
pub async fn revoke(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET cancel_requested = TRUE,
            state = CASE WHEN state = 'PENDING' THEN 'REVOKED' ELSE state END,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Worker pool ============

/// Run the worker pool. With `drain` the pool exits once the queue is empty
/// (CLI `docket ingest`); otherwise workers poll forever (`docket worker`).
pub async fn run_workers(ctx: Arc<AppContext>, drain: bool) -> Result<()> {
    let worker_count = ctx.config.queue.workers;
    let mut joins = Vec::with_capacity(worker_count);

    for worker_no in 0..worker_count {
        let ctx = ctx.clone();
        joins.push(tokio::spawn(async move {
            worker_loop(ctx, worker_no, drain).await;
        }));
    }

    for join in joins {
        join.await?;
    }
    Ok(())
}

async fn worker_loop(ctx: Arc<AppContext>, worker_no: usize, drain: bool) {
    loop {
        match claim_next(&ctx).await {
            Ok(Some((handle, kind, payload))) => {
                let task_id = handle.id;
                tracing::info!(worker = worker_no, task = %task_id, kind = %kind, "task claimed");

                let hard = Duration::from_secs(ctx.config.queue.task_hard_timeout_seconds);
                let outcome =
                    tokio::time::timeout(hard, execute_task(&ctx, &handle, &kind, &payload)).await;

                let finish = match outcome {
                    Ok(result) => result,
                    Err(_) => TaskFinish::failure("hard deadline exceeded"),
                };
                if let Err(e) = finish_task(&ctx.pool, task_id, finish).await {
                    tracing::error!(task = %task_id, error = %e, "failed to record task result");
                }
            }
            Ok(None) => {
                if drain {
                    return;
                }
                if let Err(e) = sweep_exhausted(&ctx.pool).await {
                    tracing::warn!(error = %e, "task sweep failed");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                tracing::error!(worker = worker_no, error = %e, "claim failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Claim the oldest runnable task: PENDING, or an expired lease from a dead
/// worker.
async fn claim_next(
    ctx: &AppContext,
) -> Result<Option<(TaskHandle, String, serde_json::Value)>> {
    let lease = ctx.config.queue.task_hard_timeout_seconds as f64;

    let row = sqlx::query(
        r#"
        UPDATE tasks
        SET state = 'STARTED', attempts = attempts + 1,
            lease_expires_at = now() + make_interval(secs => $1),
            updated_at = now()
        WHERE id = (
            SELECT id FROM tasks
            WHERE (state = 'PENDING'
                   OR (state IN ('STARTED', 'PROGRESS') AND lease_expires_at < now()))
              AND NOT cancel_requested
              AND attempts < $2
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING id, kind, payload
        "#,
    )
    .bind(lease)
    .bind(MAX_ATTEMPTS)
    .fetch_optional(&ctx.pool)
    .await?;

    Ok(row.map(|r| {
        (
            TaskHandle {
                id: r.get("id"),
                pool: ctx.pool.clone(),
            },
            r.get("kind"),
            r.get("payload"),
        )
    }))
}

/// Give up on tasks that kept expiring their lease.
async fn sweep_exhausted(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET state = 'FAILURE', error = 'delivery attempts exhausted', updated_at = now()
        WHERE state IN ('STARTED', 'PROGRESS')
          AND lease_expires_at < now()
          AND attempts >= $1
        "#,
    )
    .bind(MAX_ATTEMPTS)
    .execute(pool)
    .await?;
    Ok(())
}

struct TaskFinish {
    state: &'static str,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl TaskFinish {
    fn success(result: serde_json::Value) -> Self {
        Self {
            state: "SUCCESS",
            result: Some(result),
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            state: "FAILURE",
            result: None,
            error: Some(error.into()),
        }
    }

    fn revoked() -> Self {
        Self {
            state: "REVOKED",
            result: None,
            error: None,
        }
    }
}

async fn finish_task(pool: &PgPool, id: Uuid, finish: TaskFinish) -> Result<()> {
    let progress = if finish.state == "SUCCESS" { 100 } else { -1 };
    sqlx::query(
        r#"
        UPDATE tasks
        SET state = $2, result = $3, error = $4,
            progress = CASE WHEN $5 >= 0 THEN $5 ELSE progress END,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(finish.state)
    .bind(&finish.result)
    .bind(&finish.error)
    .bind(progress)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Task execution ============

async fn execute_task(
    ctx: &Arc<AppContext>,
    handle: &TaskHandle,
    kind: &str,
    payload: &serde_json::Value,
) -> TaskFinish {
    match kind {
        KIND_INGEST_FOLDER => execute_ingest_folder(ctx, handle, payload).await,
        KIND_RUN_FULL_PIPELINE => execute_pipeline(ctx, handle, payload).await,
        KIND_REPROCESS_DOCUMENT => execute_reprocess(ctx, handle, payload).await,
        KIND_REBUILD_HNSW => match crate::migrate::rebuild_hnsw_index(&ctx.pool).await {
            Ok(()) => TaskFinish::success(serde_json::json!({ "rebuilt": true })),
            Err(e) => TaskFinish::failure(e.to_string()),
        },
        other => TaskFinish::failure(format!("unknown task kind: {}", other)),
    }
}

async fn execute_ingest_folder(
    ctx: &Arc<AppContext>,
    handle: &TaskHandle,
    payload: &serde_json::Value,
) -> TaskFinish {
    let Some(folder_id) = payload.get("folder_id").and_then(|v| v.as_str()) else {
        return TaskFinish::failure("payload missing folder_id");
    };
    let options: ScanOptions = payload
        .get("options")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    handle.set_progress(5, "sync").await.ok();
    let run_id = handle.id.to_string();

    let outcome = match crate::ingest::scan_folder(ctx, folder_id, &run_id, &options).await {
        Ok(o) => o,
        Err(e) => return TaskFinish::failure(e.to_string()),
    };

    let mut queued = Vec::with_capacity(outcome.document_ids.len());
    for document_id in &outcome.document_ids {
        match enqueue_pipeline(&ctx.pool, *document_id).await {
            Ok(task_id) => queued.push(task_id),
            Err(e) => {
                tracing::error!(document = %document_id, error = %e, "pipeline enqueue failed")
            }
        }
    }

    if outcome.document_ids.is_empty() {
        ctx.storage.scratch_purge(&run_id).ok();
    }

    TaskFinish::success(serde_json::json!({
        "documents_found": outcome.documents_found,
        "queued_tasks": queued,
        "references_written": outcome.references_written,
        "unchanged": outcome.unchanged,
        "purged": outcome.purged,
    }))
}

async fn execute_pipeline(
    ctx: &Arc<AppContext>,
    handle: &TaskHandle,
    payload: &serde_json::Value,
) -> TaskFinish {
    let Some(document_id) = payload
        .get("document_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return TaskFinish::failure("payload missing document_id");
    };

    let finish = match crate::pipeline::run_pipeline(ctx, document_id, Some(handle)).await {
        Ok(RunOutcome::Completed) => TaskFinish::success(
            serde_json::json!({ "document_id": document_id, "status": "completed" }),
        ),
        Ok(RunOutcome::Revoked) => TaskFinish::revoked(),
        Err(e) => TaskFinish::failure(e.to_string()),
    };

    cleanup_scratch_copy(ctx, document_id).await;
    maybe_schedule_rebuild(ctx).await;
    finish
}

async fn execute_reprocess(
    ctx: &Arc<AppContext>,
    handle: &TaskHandle,
    payload: &serde_json::Value,
) -> TaskFinish {
    let Some(document_id) = payload
        .get("document_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return TaskFinish::failure("payload missing document_id");
    };
    let from_step = payload.get("from_step").and_then(|v| v.as_i64()).unwrap_or(2) as i32;

    match crate::pipeline::reprocess(ctx, document_id, from_step, Some(handle)).await {
        Ok(RunOutcome::Completed) => TaskFinish::success(
            serde_json::json!({ "document_id": document_id, "from_step": from_step }),
        ),
        Ok(RunOutcome::Revoked) => TaskFinish::revoked(),
        Err(e) => TaskFinish::failure(e.to_string()),
    }
}

/// Drop the document's scratch copy once its pipeline is done; the durable
/// original lives in the bucket.
async fn cleanup_scratch_copy(ctx: &AppContext, document_id: Uuid) {
    let path: Option<String> =
        sqlx::query_scalar::<_, Option<String>>("SELECT metadata->>'local_path' FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&ctx.pool)
            .await
            .ok()
            .flatten()
            .flatten();

    if let Some(path) = path {
        let _ = std::fs::remove_file(&path);
    }
}

/// Enqueue an index rebuild when enough chunks piled up since the last one
/// and no rebuild is already waiting.
async fn maybe_schedule_rebuild(ctx: &AppContext) {
    let threshold = ctx.config.index.rebuild_threshold;
    let added = match crate::embed_stage::chunks_since_last_rebuild(ctx).await {
        Ok(n) => n,
        Err(_) => return,
    };
    if added < threshold {
        return;
    }

    let pending: Option<i64> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE kind = $1 AND state IN ('PENDING', 'STARTED', 'PROGRESS')",
    )
    .bind(KIND_REBUILD_HNSW)
    .fetch_optional(&ctx.pool)
    .await
    .unwrap_or(None);

    if pending.unwrap_or(0) == 0 {
        if let Err(e) = enqueue(&ctx.pool, KIND_REBUILD_HNSW, serde_json::json!({})).await {
            tracing::warn!(error = %e, "could not enqueue index rebuild");
        } else {
            tracing::info!(added, threshold, "index rebuild scheduled");
        }
    }
}
