//! Stage 6 — Enrich.
//!
//! Anchors parent chunks to events. For each parent the LLM infers a
//! structured event signal; the normalized title is matched against existing
//! events (exact within year, then Levenshtein ratio ≥ 0.85 within year) and
//! a new `planned` event is created when nothing matches. The mapping
//! propagates to the parent's children, and the raw inferred title is stored
//! either way so the signal survives a failed match.
//!
//! The stage also applies the access-level policy, resolves the time-decay
//! anchor (event date wins over the drive modified time, which wins over the
//! ingest date), reconciles each touched event's chunk-id aggregates, and
//! for meeting documents folds per-section summaries into the event's
//! timeline, decisions, and action items.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::StageResult;
use crate::models::{DocCategory, MeetingSubtype};

/// Minimum Levenshtein similarity for a fuzzy event-title match.
const FUZZY_MATCH_RATIO: f64 = 0.85;

pub async fn run(ctx: &AppContext, document_id: Uuid) -> StageResult<()> {
    let doc = sqlx::query(
        r#"
        SELECT doc_category, meeting_subtype, access_level, year,
               metadata->>'drive_modified_time' AS drive_modified
        FROM documents WHERE id = $1
        "#,
    )
    .bind(document_id)
    .fetch_one(&ctx.pool)
    .await?;

    let category: Option<DocCategory> = doc
        .get::<Option<String>, _>("doc_category")
        .as_deref()
        .and_then(DocCategory::parse);
    let subtype: Option<MeetingSubtype> = doc
        .get::<Option<String>, _>("meeting_subtype")
        .as_deref()
        .and_then(MeetingSubtype::parse);
    let stored_level: i32 = doc.get("access_level");
    let doc_year: Option<i32> = doc.get("year");
    let drive_modified: Option<NaiveDate> = doc
        .get::<Option<String>, _>("drive_modified")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.date_naive());

    let access_level = access_level_for(category, subtype, stored_level);

    let parents = sqlx::query("SELECT id, content FROM document_chunks WHERE document_id = $1 AND is_parent ORDER BY chunk_index")
        .bind(document_id)
        .fetch_all(&ctx.pool)
        .await?;

    let mut event_votes: HashMap<Uuid, usize> = HashMap::new();
    let mut event_dates: HashMap<Uuid, Option<NaiveDate>> = HashMap::new();
    let mut touched_events: Vec<Uuid> = Vec::new();

    for parent in &parents {
        let parent_id: Uuid = parent.get("id");
        let content: String = parent.get("content");

        let inferred = ctx.llm.infer_event(&content).await?;
        let normalized = normalize_title(&inferred.event_title);
        let year = inferred.year.or(doc_year);

        let event_id = if normalized.is_empty() {
            None
        } else {
            let matched = match_event(ctx, &normalized, year).await?;
            match matched {
                Some((id, date)) => {
                    event_dates.entry(id).or_insert(date);
                    Some(id)
                }
                None => {
                    let id = create_event(ctx, &normalized, year, &inferred).await?;
                    event_dates.insert(id, inferred.date);
                    Some(id)
                }
            }
        };

        let raw_title = if inferred.event_title.trim().is_empty() {
            None
        } else {
            Some(inferred.event_title.trim().to_string())
        };

        sqlx::query(
            "UPDATE document_chunks SET related_event_id = $2, inferred_event_title = $3 WHERE id = $1 OR parent_chunk_id = $1",
        )
        .bind(parent_id)
        .bind(event_id)
        .bind(&raw_title)
        .execute(&ctx.pool)
        .await?;

        if let Some(id) = event_id {
            *event_votes.entry(id).or_insert(0) += 1;
            if !touched_events.contains(&id) {
                touched_events.push(id);
            }

            if category == Some(DocCategory::MeetingDocument) {
                aggregate_section(ctx, id, document_id, parent_id, &content, subtype).await?;
            }
        }
    }

    for event_id in &touched_events {
        reconcile_event_chunk_ids(ctx, *event_id).await?;
    }

    // Informational only; the chunk-level mapping is authoritative.
    let doc_event_id = unique_mode(&event_votes);
    let event_date = doc_event_id.and_then(|id| event_dates.get(&id).copied().flatten());
    let time_decay_date = resolve_time_decay_date(event_date, drive_modified);

    let mut tx = ctx.pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE documents
        SET access_level = $2, event_id = $3, time_decay_date = $4,
            current_step = 6, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(access_level)
    .bind(doc_event_id)
    .bind(time_decay_date)
    .execute(&mut *tx)
    .await?;

    // Chunks inherit the document level; no per-chunk override.
    sqlx::query("UPDATE document_chunks SET access_level = $2 WHERE document_id = $1")
        .bind(document_id)
        .bind(access_level)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

/// Access-level policy:
/// result ⇒ 4, other meeting documents ⇒ 3, work ⇒ 2, other ⇒ the
/// document's stored default.
pub fn access_level_for(
    category: Option<DocCategory>,
    subtype: Option<MeetingSubtype>,
    stored: i32,
) -> i32 {
    match (category, subtype) {
        (Some(DocCategory::MeetingDocument), Some(MeetingSubtype::Result)) => 4,
        (Some(DocCategory::MeetingDocument), _) => 3,
        (Some(DocCategory::WorkDocument), _) => 2,
        _ => stored.clamp(1, 4),
    }
}

/// Event date wins; then the drive modified date; then today.
pub fn resolve_time_decay_date(
    event_date: Option<NaiveDate>,
    drive_modified: Option<NaiveDate>,
) -> NaiveDate {
    event_date
        .or(drive_modified)
        .unwrap_or_else(|| Utc::now().date_naive())
}

/// Exact match on normalized title (year equal or event year null), then
/// fuzzy within year.
async fn match_event(
    ctx: &AppContext,
    normalized: &str,
    year: Option<i32>,
) -> StageResult<Option<(Uuid, Option<NaiveDate>)>> {
    let candidates = sqlx::query(
        "SELECT id, title, year, event_date FROM events WHERE $1::int IS NULL OR year IS NULL OR year = $1",
    )
    .bind(year)
    .fetch_all(&ctx.pool)
    .await?;

    // Exact pass.
    for row in &candidates {
        let title: String = row.get("title");
        if normalize_title(&title) == normalized {
            return Ok(Some((row.get("id"), row.get("event_date"))));
        }
    }

    // Fuzzy pass, restricted to the same year.
    for row in &candidates {
        let candidate_year: Option<i32> = row.get("year");
        if year.is_some() && candidate_year != year {
            continue;
        }
        let title: String = row.get("title");
        if similarity_ratio(&normalize_title(&title), normalized) >= FUZZY_MATCH_RATIO {
            return Ok(Some((row.get("id"), row.get("event_date"))));
        }
    }

    Ok(None)
}

async fn create_event(
    ctx: &AppContext,
    normalized: &str,
    year: Option<i32>,
    inferred: &crate::llm::InferredEvent,
) -> StageResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO events (id, title, year, event_date, department, status)
        VALUES ($1, $2, $3, $4, $5, 'planned')
        "#,
    )
    .bind(id)
    .bind(normalized)
    .bind(year)
    .bind(inferred.date)
    .bind(&inferred.department)
    .execute(&ctx.pool)
    .await?;

    tracing::info!(event = %id, title = normalized, "event created");
    Ok(id)
}

/// Fold one agenda section into the event's aggregates.
async fn aggregate_section(
    ctx: &AppContext,
    event_id: Uuid,
    document_id: Uuid,
    parent_id: Uuid,
    content: &str,
    subtype: Option<MeetingSubtype>,
) -> StageResult<()> {
    let kind = subtype.map(|s| s.as_str()).unwrap_or("meeting");
    let summary = ctx.llm.summarize_section(content, kind).await?;
    if summary.summary.is_empty() && summary.action_items.is_empty() {
        return Ok(());
    }

    let timeline_entry = serde_json::json!([{
        "document_id": document_id,
        "chunk_id": parent_id,
        "kind": kind,
        "summary": summary.summary,
    }]);
    let decisions = if summary.has_decision {
        serde_json::json!([summary.summary])
    } else {
        serde_json::json!([])
    };
    let actions = serde_json::Value::from(summary.action_items.clone());

    sqlx::query(
        r#"
        UPDATE events
        SET chunk_timeline = chunk_timeline || $2,
            decision_summaries = decision_summaries || $3,
            action_items = action_items || $4,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(event_id)
    .bind(timeline_entry)
    .bind(decisions)
    .bind(actions)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// Recompute `parent_chunk_ids` / `child_chunk_ids` from the chunks table.
/// The stored arrays are a cache of this query, refreshed on every
/// enrichment that touches the event.
async fn reconcile_event_chunk_ids(ctx: &AppContext, event_id: Uuid) -> StageResult<()> {
    sqlx::query(
        r#"
        UPDATE events SET
            parent_chunk_ids = COALESCE(
                (SELECT jsonb_agg(id ORDER BY id) FROM document_chunks
                 WHERE related_event_id = $1 AND is_parent), '[]'),
            child_chunk_ids = COALESCE(
                (SELECT jsonb_agg(id ORDER BY id) FROM document_chunks
                 WHERE related_event_id = $1 AND NOT is_parent), '[]'),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(event_id)
    .execute(&ctx.pool)
    .await?;
    Ok(())
}

/// The most frequent value, only when the mode is unambiguous.
fn unique_mode(votes: &HashMap<Uuid, usize>) -> Option<Uuid> {
    let max = votes.values().copied().max()?;
    let mut winners = votes.iter().filter(|(_, &n)| n == max);
    let (first, _) = winners.next()?;
    if winners.next().is_some() {
        None
    } else {
        Some(*first)
    }
}

/// Strip a leading ordinal prefix (`1. `, `2) `) and collapse whitespace.
/// A leading year is part of the title and stays.
pub fn normalize_title(title: &str) -> String {
    let trimmed = title.trim();
    let stripped = ordinal_prefix_re().replace(trimmed, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ordinal_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,2}[.)]\s*").unwrap())
}

/// Classic DP Levenshtein over characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_policy_tiers() {
        use DocCategory::*;
        use MeetingSubtype::*;
        assert_eq!(access_level_for(Some(MeetingDocument), Some(Result), 1), 4);
        assert_eq!(access_level_for(Some(MeetingDocument), Some(Minutes), 1), 3);
        assert_eq!(access_level_for(Some(MeetingDocument), Some(Agenda), 1), 3);
        assert_eq!(access_level_for(Some(MeetingDocument), None, 1), 3);
        assert_eq!(access_level_for(Some(WorkDocument), None, 1), 2);
        assert_eq!(access_level_for(Some(OtherDocument), None, 2), 2);
        assert_eq!(access_level_for(None, None, 0), 1);
    }

    #[test]
    fn time_decay_provenance() {
        let event = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        let drive = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(resolve_time_decay_date(Some(event), Some(drive)), event);
        assert_eq!(resolve_time_decay_date(None, Some(drive)), drive);
        assert_eq!(resolve_time_decay_date(None, None), Utc::now().date_naive());
    }

    #[test]
    fn normalize_strips_ordinals_not_years() {
        assert_eq!(normalize_title("1. 5차회의"), "5차회의");
        assert_eq!(normalize_title("2) 가을  축제"), "가을 축제");
        assert_eq!(normalize_title("2025 봄 축제"), "2025 봄 축제");
        assert_eq!(normalize_title("  5차회의  "), "5차회의");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("5차회의", "5차 회의".replace(' ', "").as_str()), 0);
    }

    #[test]
    fn similarity_threshold_behavior() {
        assert!(similarity_ratio("2025 봄 축제", "2025 봄 축제") >= FUZZY_MATCH_RATIO);
        assert!(similarity_ratio("2025 봄 축제 기획", "2025 봄 축제 기획안") >= FUZZY_MATCH_RATIO);
        assert!(similarity_ratio("봄 축제", "가을 체육대회") < FUZZY_MATCH_RATIO);
    }

    #[test]
    fn unique_mode_requires_single_winner() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut votes = HashMap::new();
        votes.insert(a, 3usize);
        votes.insert(b, 1usize);
        assert_eq!(unique_mode(&votes), Some(a));

        votes.insert(b, 3usize);
        assert_eq!(unique_mode(&votes), None);
        assert_eq!(unique_mode(&HashMap::new()), None);
    }
}
