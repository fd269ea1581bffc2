//! Stage 5 — Chunk.
//!
//! Splits `preprocessed_content` into the two-level retrieval hierarchy: one
//! parent chunk per agenda-item section, zero-or-more child windows per
//! parent. Parents hold the full section text and are never embedded;
//! children are ~500-character windows with a small overlap, broken at
//! sentence boundaries when possible, each carrying a denormalized copy of
//! its parent's text plus character offsets into the preprocessed content.
//!
//! Sections come from the header pattern `^(#{1,2})\s+(.+)$`. A document
//! with H2 headers parents on H2; H1-only documents parent on H1; a document
//! with no headers at all becomes a single parent with its windows as
//! children.
//!
//! Offsets (`start_char`/`end_char`) are in characters, not bytes — the
//! corpus is largely Korean and byte offsets would land mid-codepoint.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};
use crate::models::{ChunkType, DocumentChunk};

/// Target child window size, in characters.
pub const WINDOW_CHARS: usize = 500;
/// Overlap between consecutive windows, in characters.
pub const OVERLAP_CHARS: usize = 50;
/// Rough chars-per-token ratio used for `token_count`.
const CHARS_PER_TOKEN: usize = 4;

/// One header-delimited region of the preprocessed text.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// The full header line (`## 논의안건 1. …`), or `None` for preamble
    /// text before the first header / header-less documents.
    pub header: Option<String>,
    /// Full section text, header line included.
    pub content: String,
    /// Section body without the header line.
    pub body: String,
    /// Char offset of the section start in the whole document.
    pub start_char: usize,
    /// Char offset one past the section end.
    pub end_char: usize,
    /// Char offset of the body start.
    pub body_start: usize,
}

pub async fn run(ctx: &AppContext, document_id: Uuid) -> StageResult<u64> {
    let row: (Option<String>, i32) =
        sqlx::query_as("SELECT preprocessed_content, access_level FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_one(&ctx.pool)
            .await?;

    let text = row.0.unwrap_or_default();
    let access_level = row.1;

    if text.trim().is_empty() {
        return Err(PipelineError::stage("chunk", "preprocessed_content is empty"));
    }

    let groups = build_chunks(document_id, access_level, &text);
    if groups.is_empty() {
        return Err(PipelineError::stage("chunk", "no sections produced"));
    }

    // Replace any previous chunks before inserting; reruns and reprocessing
    // land here with old rows still present.
    sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
        .bind(document_id)
        .execute(&ctx.pool)
        .await?;

    let mut written = 0u64;
    for (parent, children) in &groups {
        let mut tx = ctx.pool.begin().await?;
        insert_chunk(&mut tx, parent).await?;
        written += 1;
        for child in children {
            assert_eq!(
                child.parent_content, parent.content,
                "child parent_content must mirror its parent"
            );
            insert_chunk(&mut tx, child).await?;
            written += 1;
        }
        tx.commit().await?;
    }

    sqlx::query(
        "UPDATE documents SET current_step = 5, updated_at = now() WHERE id = $1",
    )
    .bind(document_id)
    .execute(&ctx.pool)
    .await?;

    Ok(written)
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    chunk: &DocumentChunk,
) -> StageResult<()> {
    chunk.assert_hierarchy_invariant();

    sqlx::query(
        r#"
        INSERT INTO document_chunks
            (id, document_id, parent_chunk_id, is_parent, chunk_index, chunk_type,
             content, parent_content, section_header, access_level, metadata,
             token_count, start_char, end_char)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(chunk.id)
    .bind(chunk.document_id)
    .bind(chunk.parent_chunk_id)
    .bind(chunk.is_parent)
    .bind(chunk.chunk_index)
    .bind(chunk.chunk_type.as_str())
    .bind(&chunk.content)
    .bind(&chunk.parent_content)
    .bind(&chunk.section_header)
    .bind(chunk.access_level)
    .bind(&chunk.metadata)
    .bind(chunk.token_count)
    .bind(chunk.start_char)
    .bind(chunk.end_char)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Build the full parent/child set for a document. Returns one entry per
/// parent, children in window order.
pub fn build_chunks(
    document_id: Uuid,
    access_level: i32,
    text: &str,
) -> Vec<(DocumentChunk, Vec<DocumentChunk>)> {
    let sections = split_sections(text);
    let mut out = Vec::with_capacity(sections.len());

    for (parent_index, section) in sections.iter().enumerate() {
        let parent_id = Uuid::new_v4();
        let chunk_type = detect_chunk_type(&section.content);

        let parent = DocumentChunk {
            id: parent_id,
            document_id,
            parent_chunk_id: None,
            related_event_id: None,
            inferred_event_title: None,
            is_parent: true,
            chunk_index: parent_index as i32,
            chunk_type,
            content: section.content.clone(),
            parent_content: section.content.clone(),
            section_header: section.header.clone(),
            embedding: None,
            access_level,
            metadata: serde_json::json!({}),
            token_count: token_count(&section.content),
            start_char: section.start_char as i32,
            end_char: section.end_char as i32,
        };

        let body_chars: Vec<char> = section.body.chars().collect();
        let spans = window_spans(&body_chars, WINDOW_CHARS, OVERLAP_CHARS);

        let mut children = Vec::with_capacity(spans.len().max(1));
        if spans.is_empty() {
            // Header-only section: the header itself is still retrievable.
            children.push(child_chunk(
                document_id,
                parent_id,
                &parent,
                0,
                section.content.clone(),
                section.start_char,
                section.end_char,
                access_level,
            ));
        } else {
            for (child_index, (start, end)) in spans.iter().enumerate() {
                let content: String = body_chars[*start..*end].iter().collect();
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    continue;
                }
                children.push(child_chunk(
                    document_id,
                    parent_id,
                    &parent,
                    child_index as i32,
                    trimmed.to_string(),
                    section.body_start + start,
                    section.body_start + end,
                    access_level,
                ));
            }
            if children.is_empty() {
                children.push(child_chunk(
                    document_id,
                    parent_id,
                    &parent,
                    0,
                    section.content.clone(),
                    section.start_char,
                    section.end_char,
                    access_level,
                ));
            }
        }

        out.push((parent, children));
    }

    out
}

#[allow(clippy::too_many_arguments)]
fn child_chunk(
    document_id: Uuid,
    parent_id: Uuid,
    parent: &DocumentChunk,
    index: i32,
    content: String,
    start_char: usize,
    end_char: usize,
    access_level: i32,
) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::new_v4(),
        document_id,
        parent_chunk_id: Some(parent_id),
        related_event_id: None,
        inferred_event_title: None,
        is_parent: false,
        chunk_index: index,
        chunk_type: parent.chunk_type,
        token_count: token_count(&content),
        content,
        parent_content: parent.content.clone(),
        section_header: parent.section_header.clone(),
        embedding: None,
        access_level,
        metadata: serde_json::json!({}),
        start_char: start_char as i32,
        end_char: end_char as i32,
    }
}

/// Split the document at every H1/H2 header line. Preamble text before the
/// first header becomes a header-less section; a document without headers is
/// one big section.
pub fn split_sections(text: &str) -> Vec<Section> {
    let mut boundaries: Vec<(usize, Option<String>)> = Vec::new();

    // Char offset of each line start.
    let mut offset = 0usize;
    let mut line_starts: Vec<(usize, &str)> = Vec::new();
    for line in text.split('\n') {
        line_starts.push((offset, line));
        offset += line.chars().count() + 1;
    }
    let total_chars = text.chars().count();

    let has_h2 = line_starts
        .iter()
        .any(|(_, l)| header_re().captures(l).map(|c| c[1].len() == 2).unwrap_or(false));

    for (start, line) in &line_starts {
        if let Some(caps) = header_re().captures(line) {
            let level = caps[1].len();
            let is_parent_header = if has_h2 { level == 2 } else { level == 1 };
            let marker = if is_parent_header {
                Some(line.trim().to_string())
            } else {
                // A non-parenting header still breaks the running section so
                // its text does not leak into the previous agenda item.
                None
            };
            boundaries.push((*start, marker));
        }
    }

    let mut sections = Vec::new();
    let mut cursor = 0usize;
    let mut current_header: Option<String> = None;

    let mut push_section = |start: usize, end: usize, header: Option<String>| {
        if end <= start {
            return;
        }
        let content: String = text
            .chars()
            .skip(start)
            .take(end - start)
            .collect::<String>()
            .trim_end()
            .to_string();
        if content.trim().is_empty() {
            return;
        }
        let body_start = match &header {
            Some(h) => (start + h.chars().count() + 1).min(end),
            None => start,
        };
        let body: String = text
            .chars()
            .skip(body_start)
            .take(end.saturating_sub(body_start))
            .collect::<String>()
            .trim_end()
            .to_string();
        sections.push(Section {
            header,
            content,
            body,
            start_char: start,
            end_char: end,
            body_start,
        });
    };

    for (boundary, header) in boundaries {
        push_section(cursor, boundary, current_header.take());
        cursor = boundary;
        current_header = header;
    }
    push_section(cursor, total_chars, current_header);

    sections
}

/// Windows over a char slice: `window` chars long, `overlap` chars shared
/// with the previous window, cut at a sentence boundary when one exists in
/// the trailing half of the window.
pub fn window_spans(body: &[char], window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let len = body.len();
    if len == 0 {
        return Vec::new();
    }
    if len <= window {
        return vec![(0, len)];
    }

    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + window).min(len);
        let end = if hard_end < len {
            find_sentence_boundary(body, start + window / 2, hard_end).unwrap_or(hard_end)
        } else {
            hard_end
        };

        spans.push((start, end));
        if end >= len {
            break;
        }

        let next = end.saturating_sub(overlap);
        // Overlap must never stall the walk.
        start = if next > start { next } else { end };
    }

    spans
}

/// Last sentence-ending character in `[floor, end)`, returning the offset
/// just past it.
fn find_sentence_boundary(body: &[char], floor: usize, end: usize) -> Option<usize> {
    let floor = floor.min(end);
    for i in (floor..end).rev() {
        if matches!(body[i], '.' | '!' | '?' | '\n' | '。') {
            return Some(i + 1);
        }
    }
    None
}

/// A section dominated by `|` table rows is stored as a table chunk.
pub fn detect_chunk_type(content: &str) -> ChunkType {
    let mut total = 0usize;
    let mut pipes = 0usize;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        total += 1;
        if trimmed.starts_with('|') {
            pipes += 1;
        }
    }
    if total > 0 && pipes * 2 > total {
        ChunkType::Table
    } else {
        ChunkType::Text
    }
}

fn token_count(text: &str) -> i32 {
    (text.chars().count() / CHARS_PER_TOKEN) as i32
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,2})\s+(.+)$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn h2_sections_become_parents() {
        let text = "# 논의 안건\n## 논의안건 1. 축제 예산\n예산 본문입니다.\n## 논의안건 2. 일정\n일정 본문입니다.";
        let sections = split_sections(text);
        let headers: Vec<_> = sections.iter().map(|s| s.header.clone()).collect();
        assert!(headers.contains(&Some("## 논의안건 1. 축제 예산".to_string())));
        assert!(headers.contains(&Some("## 논의안건 2. 일정".to_string())));
    }

    #[test]
    fn h1_parents_without_h2() {
        let text = "# 개요\n본문 하나\n# 세부 내용\n본문 둘";
        let sections = split_sections(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].header.as_deref(), Some("# 개요"));
        assert_eq!(sections[1].header.as_deref(), Some("# 세부 내용"));
    }

    #[test]
    fn no_headers_single_parent_with_children() {
        let text = "머리글이 전혀 없는 문서입니다. 내용만 있습니다.";
        let groups = build_chunks(doc_id(), 2, text);
        assert_eq!(groups.len(), 1);
        let (parent, children) = &groups[0];
        assert!(parent.is_parent);
        assert!(parent.section_header.is_none());
        assert!(!children.is_empty());
    }

    #[test]
    fn children_carry_parent_content_and_header() {
        let body = "축제 예산 설명. ".repeat(80);
        let text = format!("## 논의안건 1. 축제 예산\n{}", body);
        let groups = build_chunks(doc_id(), 3, &text);
        assert_eq!(groups.len(), 1);
        let (parent, children) = &groups[0];
        assert!(children.len() > 1, "long body must window into several children");
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.chunk_index, i as i32);
            assert_eq!(child.parent_chunk_id, Some(parent.id));
            assert_eq!(child.parent_content, parent.content);
            assert_eq!(child.section_header.as_deref(), Some("## 논의안건 1. 축제 예산"));
            assert_eq!(child.access_level, 3);
            assert!(!child.is_parent);
        }
    }

    #[test]
    fn offsets_recover_window_text() {
        let body = "가나다라마. ".repeat(200);
        let text = format!("## 논의안건 1. 긴 본문\n{}", body);
        let chars: Vec<char> = text.chars().collect();
        let groups = build_chunks(doc_id(), 1, &text);
        for (_, children) in &groups {
            for child in children {
                let slice: String = chars[child.start_char as usize..child.end_char as usize]
                    .iter()
                    .collect();
                assert_eq!(slice.trim(), child.content);
            }
        }
    }

    #[test]
    fn windows_overlap_and_progress() {
        let body: Vec<char> = "x".repeat(1200).chars().collect();
        let spans = window_spans(&body, WINDOW_CHARS, OVERLAP_CHARS);
        assert!(spans.len() >= 2);
        for pair in spans.windows(2) {
            let (s0, e0) = pair[0];
            let (s1, _) = pair[1];
            assert!(s1 > s0, "windows must advance");
            assert!(s1 < e0, "consecutive windows share the overlap");
        }
        assert_eq!(spans.last().unwrap().1, body.len());
    }

    #[test]
    fn windows_prefer_sentence_boundaries() {
        let text = "문장입니다. ".repeat(100);
        let chars: Vec<char> = text.chars().collect();
        let spans = window_spans(&chars, WINDOW_CHARS, OVERLAP_CHARS);
        assert!(spans.len() >= 2);
        let (_, first_end) = spans[0];
        assert_eq!(chars[first_end - 1], '.');
    }

    #[test]
    fn short_body_single_window() {
        let chars: Vec<char> = "짧은 본문".chars().collect();
        assert_eq!(window_spans(&chars, WINDOW_CHARS, OVERLAP_CHARS), vec![(0, 5)]);
    }

    #[test]
    fn table_sections_detected() {
        let table = "## 예산표\n| 항목 | 금액 |\n| --- | --- |\n| 무대 | 300 |";
        assert_eq!(detect_chunk_type(table), ChunkType::Table);
        assert_eq!(detect_chunk_type("## 일반\n본문 텍스트"), ChunkType::Text);
    }

    #[test]
    fn header_only_section_still_gets_a_child() {
        let text = "## 논의안건 1. 제목만 있음";
        let groups = build_chunks(doc_id(), 1, text);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[0].1[0].content, text);
    }

    #[test]
    fn hierarchy_invariant_holds_everywhere() {
        let text = "## 논의안건 1. 축제 예산\n본문입니다.";
        for (parent, children) in build_chunks(doc_id(), 1, text) {
            parent.assert_hierarchy_invariant();
            for child in children {
                child.assert_hierarchy_invariant();
            }
        }
    }
}
