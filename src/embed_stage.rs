//! Stage 7 — Embed.
//!
//! Batches the document's child chunks through the embedder and writes the
//! vectors back, one transaction per batch. Parents are never embedded; they
//! exist for retrieval-time context only. The embed input is
//! `section_header + "\n" + content` so the agenda item's name sharpens the
//! vector. After every chunk has its vector the document flips to
//! `completed` with `processed_at` stamped.

use sqlx::Row;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};
use crate::models::EMBEDDING_DIM;

/// Per-batch progress callback: (batches_done, batches_total).
pub type BatchProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

pub async fn run(
    ctx: &AppContext,
    document_id: Uuid,
    progress: Option<BatchProgress<'_>>,
) -> StageResult<u64> {
    let rows = sqlx::query(
        r#"
        SELECT id, section_header, content FROM document_chunks
        WHERE document_id = $1 AND NOT is_parent AND embedding IS NULL
        ORDER BY parent_chunk_id, chunk_index
        "#,
    )
    .bind(document_id)
    .fetch_all(&ctx.pool)
    .await?;

    let batch_size = ctx.embedder.max_batch().max(1);
    let total_batches = rows.len().div_ceil(batch_size);
    let mut embedded = 0u64;

    for (batch_no, batch) in rows.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch
            .iter()
            .map(|row| {
                let header: Option<String> = row.get("section_header");
                let content: String = row.get("content");
                embed_input(header.as_deref(), &content)
            })
            .collect();

        let vectors = ctx.embedder.embed(&texts).await?;
        if vectors.len() != batch.len() {
            return Err(PipelineError::ExternalPermanent(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            )));
        }

        let mut tx = ctx.pool.begin().await?;
        for (row, vector) in batch.iter().zip(vectors) {
            debug_assert_eq!(vector.len(), EMBEDDING_DIM);
            let chunk_id: Uuid = row.get("id");
            sqlx::query("UPDATE document_chunks SET embedding = $2 WHERE id = $1")
                .bind(chunk_id)
                .bind(pgvector::Vector::from(vector))
                .execute(&mut *tx)
                .await?;
            embedded += 1;
        }
        tx.commit().await?;

        if let Some(report) = progress {
            report(batch_no + 1, total_batches);
        }
    }

    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'completed', current_step = 7, processed_at = now(), updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .execute(&ctx.pool)
    .await?;

    tracing::info!(document = %document_id, embedded, "document completed");
    Ok(embedded)
}

/// The text actually sent to the embedder for a child chunk.
pub fn embed_input(section_header: Option<&str>, content: &str) -> String {
    match section_header {
        Some(header) if !header.is_empty() => format!("{}\n{}", header, content),
        _ => content.to_string(),
    }
}

/// Chunks added since the last successful index rebuild. The queue enqueues
/// a `rebuild_hnsw_index` task when this crosses the configured threshold.
pub async fn chunks_since_last_rebuild(ctx: &AppContext) -> StageResult<u64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM document_chunks
        WHERE created_at > COALESCE(
            (SELECT MAX(updated_at) FROM tasks
             WHERE kind = 'rebuild_hnsw_index' AND state = 'SUCCESS'),
            'epoch'::timestamptz)
        "#,
    )
    .fetch_one(&ctx.pool)
    .await?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_input_prepends_header() {
        assert_eq!(
            embed_input(Some("## 논의안건 1. 축제 예산"), "본문"),
            "## 논의안건 1. 축제 예산\n본문"
        );
        assert_eq!(embed_input(None, "본문"), "본문");
        assert_eq!(embed_input(Some(""), "본문"), "본문");
    }
}
