//! Conversational glue over the retrieval engine.
//!
//! A chat turn rewrites the query against recent session history, retrieves
//! through [`crate::search`], generates an answer over the hits' parent
//! content, and appends both sides to the session cache. Everything
//! degrades rather than fails: a broken rewrite falls back to the raw
//! query, a refused generation returns sources with a null answer, and zero
//! hits produce a well-formed empty response.
//!
//! Session state is a bounded FIFO of recent turns with a TTL, held
//! in-process behind [`SessionStore`]. `history` and `delete_history` touch
//! only this store; the append-only `chat_logs` table is written
//! asynchronously for analytics and never read back here.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::StageResult;
use crate::search::{self, SearchFilters};

// ============ Session store ============

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

struct SessionEntry {
    turns: VecDeque<ChatTurn>,
    last_seen: Instant,
}

/// In-process session cache: per session a bounded FIFO of recent turns,
/// expired as a whole once idle past the TTL. Concurrent writers to one
/// session may interleave; the bound and TTL still hold.
pub struct SessionStore {
    inner: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
    max_turns: usize,
}

impl SessionStore {
    pub fn new(config: &crate::config::SessionConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_seconds),
            // One turn is a user/assistant message pair.
            max_turns: config.window_turns * 2,
        }
    }

    pub fn history(&self, session_id: &str) -> Vec<ChatTurn> {
        let mut map = self.inner.lock().expect("session store poisoned");
        match map.get_mut(session_id) {
            Some(entry) if entry.last_seen.elapsed() <= self.ttl => {
                entry.last_seen = Instant::now();
                entry.turns.iter().cloned().collect()
            }
            Some(_) => {
                map.remove(session_id);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    pub fn append(&self, session_id: &str, role: &str, content: &str) {
        let mut map = self.inner.lock().expect("session store poisoned");
        let entry = map.entry(session_id.to_string()).or_insert_with(|| SessionEntry {
            turns: VecDeque::new(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.turns.push_back(ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        });
        while entry.turns.len() > self.max_turns {
            entry.turns.pop_front();
        }
    }

    pub fn delete(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("session store poisoned")
            .remove(session_id);
    }
}

// ============ Chat ============

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub top_k: Option<i64>,
    pub year: Option<i32>,
    pub department: Option<String>,
    pub doc_type: Option<crate::models::DocType>,
    pub semantic_weight: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSource {
    pub document_id: Uuid,
    pub document_title: Option<String>,
    pub chunk_id: Uuid,
    pub section_header: Option<String>,
    pub relevance_score: f64,
    pub drive_link: Option<String>,
    pub event_title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMetadata {
    pub latency_ms: i64,
    pub retrieval_latency_ms: i64,
    pub generation_latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub rewritten_query: String,
    pub answer: Option<String>,
    pub sources: Vec<ChatSource>,
    pub metadata: ChatMetadata,
}

pub async fn chat(
    ctx: &AppContext,
    session_id: Option<String>,
    query: &str,
    user_level: i32,
    options: &ChatOptions,
) -> StageResult<ChatResponse> {
    let started = Instant::now();
    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let history = ctx.sessions.history(&session_id);
    let history_pairs: Vec<(String, String)> = history
        .iter()
        .map(|t| (t.role.clone(), t.content.clone()))
        .collect();

    let rewritten = match ctx.llm.rewrite_query(&history_pairs, query).await {
        Ok(Some(r)) => r,
        Ok(None) => query.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "query rewrite failed, using raw query");
            query.to_string()
        }
    };

    let retrieval_started = Instant::now();
    let top_k = options.top_k.unwrap_or(ctx.config.retrieval.default_top_k);
    let filters = SearchFilters {
        year: options.year,
        department: options.department.clone(),
        doc_type: options.doc_type,
        user_level,
        semantic_weight: options.semantic_weight,
    };
    let results = search::search(ctx, &rewritten, top_k, &filters).await?;
    let retrieval_ms = retrieval_started.elapsed().as_millis() as i64;

    let generation_started = Instant::now();
    let contexts: Vec<String> = results.hits.iter().map(|h| h.parent_content.clone()).collect();
    let answer = if contexts.is_empty() {
        None
    } else {
        match ctx.llm.generate_answer(query, &contexts).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "answer generation failed, returning sources only");
                None
            }
        }
    };
    let generation_ms = generation_started.elapsed().as_millis() as i64;

    let sources: Vec<ChatSource> = results
        .hits
        .iter()
        .map(|h| ChatSource {
            document_id: h.document_id,
            document_title: h.document_name.clone(),
            chunk_id: h.chunk_id,
            section_header: h.section_header.clone(),
            relevance_score: h.score,
            drive_link: h.drive_link.clone(),
            event_title: h.event_title.clone(),
        })
        .collect();

    let turn_index = history.iter().filter(|t| t.role == "user").count() as i32;

    ctx.sessions.append(&session_id, "user", query);
    if let Some(ref a) = answer {
        ctx.sessions.append(&session_id, "assistant", a);
    }

    let total_ms = started.elapsed().as_millis() as i64;
    log_turn(
        ctx,
        &session_id,
        user_level,
        query,
        &rewritten,
        answer.as_deref(),
        &results.hits,
        &sources,
        turn_index,
        retrieval_ms,
        generation_ms,
        total_ms,
    );

    Ok(ChatResponse {
        session_id,
        rewritten_query: rewritten,
        answer,
        sources,
        metadata: ChatMetadata {
            latency_ms: total_ms,
            retrieval_latency_ms: retrieval_ms,
            generation_latency_ms: generation_ms,
        },
    })
}

/// Fire-and-forget analytics row. A failed insert loses one log line, never
/// the chat response.
#[allow(clippy::too_many_arguments)]
fn log_turn(
    ctx: &AppContext,
    session_id: &str,
    user_level: i32,
    query: &str,
    rewritten: &str,
    answer: Option<&str>,
    hits: &[search::SearchHit],
    sources: &[ChatSource],
    turn_index: i32,
    retrieval_ms: i64,
    generation_ms: i64,
    total_ms: i64,
) {
    let pool = ctx.pool.clone();
    let session_id = session_id.to_string();
    let query = query.to_string();
    let rewritten = rewritten.to_string();
    let answer = answer.map(str::to_string);

    let chunk_snapshots = serde_json::json!(hits
        .iter()
        .map(|h| serde_json::json!({
            "chunk_id": h.chunk_id,
            "document_id": h.document_id,
            "score": h.score,
            "section_header": h.section_header,
        }))
        .collect::<Vec<_>>());
    let sources_json = serde_json::to_value(sources).unwrap_or_else(|_| serde_json::json!([]));

    tokio::spawn(async move {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_logs
                (id, session_id, user_level, query, rewritten_query, response,
                 chunks, sources, turn_index, retrieval_ms, generation_ms, total_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&session_id)
        .bind(user_level)
        .bind(&query)
        .bind(&rewritten)
        .bind(&answer)
        .bind(&chunk_snapshots)
        .bind(&sources_json)
        .bind(turn_index)
        .bind(retrieval_ms)
        .bind(generation_ms)
        .bind(total_ms)
        .execute(&pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "chat log insert failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn store(ttl_seconds: u64, window_turns: usize) -> SessionStore {
        SessionStore::new(&SessionConfig {
            ttl_seconds,
            window_turns,
        })
    }

    #[test]
    fn history_starts_empty() {
        let s = store(3600, 6);
        assert!(s.history("none").is_empty());
    }

    #[test]
    fn append_and_read_back() {
        let s = store(3600, 6);
        s.append("a", "user", "축제 예산 얼마야?");
        s.append("a", "assistant", "300만원입니다.");
        let turns = s.history("a");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");
    }

    #[test]
    fn fifo_bound_drops_oldest() {
        let s = store(3600, 2); // 2 pairs = 4 messages
        for i in 0..6 {
            s.append("a", "user", &format!("q{}", i));
        }
        let turns = s.history("a");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].content, "q2");
        assert_eq!(turns[3].content, "q5");
    }

    #[test]
    fn delete_then_history_is_empty() {
        let s = store(3600, 6);
        s.append("a", "user", "hello");
        s.delete("a");
        assert!(s.history("a").is_empty());
    }

    #[test]
    fn expired_session_reads_empty() {
        let s = store(0, 6);
        s.append("a", "user", "hello");
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.history("a").is_empty());
    }

    #[test]
    fn sessions_are_isolated() {
        let s = store(3600, 6);
        s.append("a", "user", "one");
        s.append("b", "user", "two");
        assert_eq!(s.history("a").len(), 1);
        assert_eq!(s.history("b").len(), 1);
        s.delete("a");
        assert_eq!(s.history("b").len(), 1);
    }
}
