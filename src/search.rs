//! Retrieval engine: hybrid cosine + time-decay ranking.
//!
//! A search embeds the query once and then issues a single database
//! round-trip. Scoring happens in SQL so the HNSW index and the filters work
//! in the same pass:
//!
//! ```text
//! score = w × (1 − cosine_distance(embedding, q))
//!       + (1 − w) × exp(−λ × days_since(time_decay_date))
//! ```
//!
//! with `w = semantic_weight` (default 0.7) and `λ = 0.001/day`, which keeps
//! a one-year-old chunk at ≈ 0.7 recency. Only child chunks are ranked;
//! every hit carries its denormalized `parent_content` so the LLM context
//! needs no second query. Equal scores break toward the stronger meeting
//! subtype: result > minutes > agenda.
//!
//! A search never writes, and is deterministic given identical inputs and
//! database state.

use serde::Serialize;
use sqlx::Row;
use std::time::Instant;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};
use crate::models::DocType;

/// Caller-supplied filters. `user_level` is the access floor: a chunk is
/// visible when `chunk.access_level >= user_level`.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub year: Option<i32>,
    pub department: Option<String>,
    pub doc_type: Option<DocType>,
    pub user_level: i32,
    /// Overrides `[retrieval] semantic_weight` for this query.
    pub semantic_weight: Option<f64>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            year: None,
            department: None,
            doc_type: None,
            user_level: 1,
            semantic_weight: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_name: Option<String>,
    pub section_header: Option<String>,
    /// Full text of the enclosing agenda item, for LLM context assembly.
    pub parent_content: String,
    /// The matched child window itself.
    pub content: String,
    pub score: f64,
    pub event_title: Option<String>,
    pub drive_link: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub latency_ms: i64,
}

pub async fn search(
    ctx: &AppContext,
    query_text: &str,
    top_k: i64,
    filters: &SearchFilters,
) -> StageResult<SearchResults> {
    if query_text.trim().is_empty() {
        return Err(PipelineError::InputInvalid("query must not be empty".into()));
    }
    if top_k < 0 {
        return Err(PipelineError::InputInvalid("top_k must be >= 0".into()));
    }

    let started = Instant::now();
    let query_vector = ctx.embedder.embed_query(query_text).await?;

    // Embedding happened (cache-friendly) even for k = 0.
    if top_k == 0 {
        return Ok(SearchResults {
            hits: Vec::new(),
            latency_ms: started.elapsed().as_millis() as i64,
        });
    }

    let weight = filters
        .semantic_weight
        .unwrap_or(ctx.config.retrieval.semantic_weight)
        .clamp(0.0, 1.0);
    let lambda = ctx.config.retrieval.time_decay_lambda;

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id,
               COALESCE(d.standardized_name, d.drive_name) AS document_name,
               c.section_header, c.parent_content, c.content,
               ($2::float8 * (1 - (c.embedding <=> $1))
                + (1 - $2::float8)
                  * EXP(-$3::float8 * GREATEST((CURRENT_DATE - COALESCE(d.time_decay_date, CURRENT_DATE))::float8, 0))
               ) AS score,
               e.title AS event_title,
               d.metadata->>'web_link' AS drive_link
        FROM document_chunks c
        JOIN documents d ON d.id = c.document_id
        LEFT JOIN events e ON e.id = c.related_event_id
        WHERE NOT c.is_parent
          AND c.embedding IS NOT NULL
          AND c.access_level >= $4
          AND ($5::int IS NULL OR d.year = $5)
          AND ($6::text IS NULL OR d.department = $6)
          AND ($7::text IS NULL OR d.doc_type = $7)
        ORDER BY score DESC,
                 CASE d.meeting_subtype
                     WHEN 'result' THEN 3
                     WHEN 'minutes' THEN 2
                     WHEN 'agenda' THEN 1
                     ELSE 0
                 END DESC,
                 c.id
        LIMIT $8
        "#,
    )
    .bind(pgvector::Vector::from(query_vector))
    .bind(weight)
    .bind(lambda)
    .bind(filters.user_level)
    .bind(filters.year)
    .bind(&filters.department)
    .bind(filters.doc_type.map(|t| t.as_str()))
    .bind(top_k)
    .fetch_all(&ctx.pool)
    .await?;

    let hits = rows
        .iter()
        .map(|row| SearchHit {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            document_name: row.get("document_name"),
            section_header: row.get("section_header"),
            parent_content: row.get("parent_content"),
            content: row.get("content"),
            score: row.get("score"),
            event_title: row.get("event_title"),
            drive_link: row.get("drive_link"),
        })
        .collect();

    Ok(SearchResults {
        hits,
        latency_ms: started.elapsed().as_millis() as i64,
    })
}

// ============ Scoring (Rust twin of the SQL expression) ============

/// Recency component: `exp(−λ × age_days)`.
pub fn recency_score(age_days: f64, lambda: f64) -> f64 {
    (-lambda * age_days.max(0.0)).exp()
}

/// The blended score the SQL computes, kept in Rust for tests and tuning.
pub fn blended_score(similarity: f64, age_days: f64, semantic_weight: f64, lambda: f64) -> f64 {
    semantic_weight * similarity + (1.0 - semantic_weight) * recency_score(age_days, lambda)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAMBDA: f64 = 0.001;

    #[test]
    fn one_year_old_chunk_keeps_most_recency() {
        let r = recency_score(365.0, LAMBDA);
        assert!((r - 0.694).abs() < 0.01, "expected ≈0.69, got {}", r);
    }

    #[test]
    fn newer_chunk_outranks_older_at_equal_similarity() {
        let old = blended_score(0.9, 365.0, 0.7, LAMBDA);
        let new = blended_score(0.9, 1.0, 0.7, LAMBDA);
        assert!(new > old);
    }

    #[test]
    fn semantic_weight_one_ignores_recency() {
        let a = blended_score(0.8, 0.0, 1.0, LAMBDA);
        let b = blended_score(0.8, 10_000.0, 1.0, LAMBDA);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn semantic_weight_zero_ignores_similarity() {
        let a = blended_score(0.1, 30.0, 0.0, LAMBDA);
        let b = blended_score(0.9, 30.0, 0.0, LAMBDA);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn recency_never_negative_age() {
        assert!((recency_score(-5.0, LAMBDA) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn strong_similarity_can_beat_recency() {
        let similar_old = blended_score(0.95, 365.0, 0.7, LAMBDA);
        let weak_new = blended_score(0.5, 0.0, 0.7, LAMBDA);
        assert!(similar_old > weak_new);
    }
}
