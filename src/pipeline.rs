//! Pipeline orchestrator.
//!
//! Drives the seven stages for one document as a state machine:
//! `pending → processing(step k) → completed | failed`. Stage 1 (ingest) is
//! folder-level and has already run by the time a document task exists, so a
//! pipeline run advances `current_step` from wherever it stands through 7.
//!
//! Per stage: read the document at its expected step and skip idempotently
//! when it is already past the target; execute; the stage commits its writes
//! together with the `current_step` increment. Temporary upstream failures
//! retry with bounded backoff; permanent ones (or exhaustion) mark the
//! document `failed` with `error_message` set and stop — downstream stages
//! never run. A cancellation request from the queue is honored between
//! stages.

use std::time::Duration;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};
use crate::queue::TaskHandle;

/// Final stage number; a completed document sits at `current_step = 7`.
pub const FINAL_STEP: i32 = 7;

/// How a pipeline run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Revoked,
}

pub fn stage_name(step: i32) -> &'static str {
    match step {
        1 => "ingest",
        2 => "classify",
        3 => "parse",
        4 => "preprocess",
        5 => "chunk",
        6 => "enrich",
        7 => "embed",
        _ => "unknown",
    }
}

/// Run all remaining stages for one document.
pub async fn run_pipeline(
    ctx: &AppContext,
    document_id: Uuid,
    handle: Option<&TaskHandle>,
) -> StageResult<RunOutcome> {
    let current = current_step(ctx, document_id).await?;

    for step in (current + 1)..=FINAL_STEP {
        if let Some(h) = handle {
            if h.is_cancel_requested().await? {
                tracing::info!(document = %document_id, step, "pipeline revoked");
                return Ok(RunOutcome::Revoked);
            }
        }

        // Another delivery of the same task may have advanced the document.
        if current_step(ctx, document_id).await? >= step {
            continue;
        }

        if let Err(e) = run_stage_with_retry(ctx, document_id, step, handle).await {
            let failure = e.into_stage_failure(stage_name(step));
            mark_failed(ctx, document_id, &failure).await?;
            return Err(failure);
        }

        if let Some(h) = handle {
            let pct = (step * 100 / FINAL_STEP).min(99);
            h.set_progress(pct, stage_name(step)).await.ok();
        }
    }

    Ok(RunOutcome::Completed)
}

async fn run_stage_with_retry(
    ctx: &AppContext,
    document_id: Uuid,
    step: i32,
    handle: Option<&TaskHandle>,
) -> StageResult<()> {
    let attempts = ctx.config.queue.retry_attempts.max(1);
    let mut last_err: Option<PipelineError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = Duration::from_secs((1u64 << (attempt - 1).min(6)).min(60));
            tokio::time::sleep(delay).await;
            tracing::warn!(
                document = %document_id,
                stage = stage_name(step),
                attempt,
                "retrying stage"
            );
        }

        match run_stage(ctx, document_id, step, handle).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| PipelineError::stage(stage_name(step), "retries exhausted")))
}

async fn run_stage(
    ctx: &AppContext,
    document_id: Uuid,
    step: i32,
    handle: Option<&TaskHandle>,
) -> StageResult<()> {
    match step {
        2 => crate::classify::run(ctx, document_id).await,
        3 => crate::parse::run(ctx, document_id).await,
        4 => crate::preprocess::run(ctx, document_id).await,
        5 => crate::chunk::run(ctx, document_id).await.map(|_| ()),
        6 => crate::enrich::run(ctx, document_id).await,
        7 => {
            // Embedding reports per-batch progress through the task row.
            let reporter = handle.cloned().map(|h| {
                move |done: usize, total: usize| {
                    let h = h.clone();
                    let pct = 86 + (done * 13 / total.max(1)) as i32;
                    tokio::spawn(async move {
                        h.set_progress(pct.min(99), "embed").await.ok();
                    });
                }
            });
            match reporter {
                Some(cb) => crate::embed_stage::run(ctx, document_id, Some(&cb)).await.map(|_| ()),
                None => crate::embed_stage::run(ctx, document_id, None).await.map(|_| ()),
            }
        }
        other => Err(PipelineError::InputInvalid(format!("no stage {}", other))),
    }
}

async fn current_step(ctx: &AppContext, document_id: Uuid) -> StageResult<i32> {
    let step: Option<i32> = sqlx::query_scalar("SELECT current_step FROM documents WHERE id = $1")
        .bind(document_id)
        .fetch_optional(&ctx.pool)
        .await?;
    step.ok_or_else(|| PipelineError::InputInvalid(format!("unknown document {}", document_id)))
}

async fn mark_failed(ctx: &AppContext, document_id: Uuid, error: &PipelineError) -> StageResult<()> {
    sqlx::query(
        "UPDATE documents SET status = 'failed', error_message = $2, updated_at = now() WHERE id = $1",
    )
    .bind(document_id)
    .bind(error.to_string())
    .execute(&ctx.pool)
    .await?;
    Ok(())
}

/// Explicit reprocess: clear everything downstream of `from_step` in one
/// transaction, reset `current_step`, then resume the pipeline. This is the
/// only sanctioned way `current_step` regresses.
pub async fn reprocess(
    ctx: &AppContext,
    document_id: Uuid,
    from_step: i32,
    handle: Option<&TaskHandle>,
) -> StageResult<RunOutcome> {
    if !(2..=FINAL_STEP).contains(&from_step) {
        return Err(PipelineError::InputInvalid(format!(
            "from_step must be between 2 and {}, got {}",
            FINAL_STEP, from_step
        )));
    }

    let mut tx = ctx.pool.begin().await?;

    if from_step <= 3 {
        sqlx::query("UPDATE documents SET raw_content = NULL, parsed_content = NULL WHERE id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    }
    if from_step <= 4 {
        sqlx::query("UPDATE documents SET preprocessed_content = NULL WHERE id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    }
    if from_step <= 5 {
        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    } else if from_step <= 6 {
        sqlx::query(
            "UPDATE document_chunks SET related_event_id = NULL, inferred_event_title = NULL WHERE document_id = $1",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query("UPDATE document_chunks SET embedding = NULL WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        UPDATE documents
        SET current_step = $2, status = 'processing', error_message = NULL,
            processed_at = NULL, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(from_step - 1)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    run_pipeline(ctx, document_id, handle).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_cover_all_steps() {
        for step in 1..=FINAL_STEP {
            assert_ne!(stage_name(step), "unknown");
        }
        assert_eq!(stage_name(0), "unknown");
        assert_eq!(stage_name(8), "unknown");
    }
}
