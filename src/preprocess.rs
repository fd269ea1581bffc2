//! Stage 4 — Preprocess.
//!
//! Normalizes parsed markdown into a disciplined header hierarchy: H1 for
//! agenda categories (보고/논의/의결/기타 안건), H2 for individual agenda
//! items (`## 논의안건 N. 제목`). Rules run first; the LLM is only asked to
//! restructure when no structural headers can be detected at all, and its
//! output is accepted only when it is markdown with at least one header.
//! When even that fails, the normalized text is stored as a single untitled
//! section — retrieval still works, chunking just degenerates.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};

pub async fn run(ctx: &AppContext, document_id: Uuid) -> StageResult<()> {
    let parsed: Option<String> =
        sqlx::query_scalar("SELECT parsed_content FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_one(&ctx.pool)
            .await?;

    let parsed = parsed.unwrap_or_default();
    if parsed.trim().is_empty() {
        return Err(PipelineError::stage("preprocess", "parsed_content is empty"));
    }

    let normalized = normalize_whitespace(&parsed);
    let retagged = retag_headers(&normalized);

    let preprocessed = if has_structural_headers(&retagged) {
        retagged
    } else {
        match ctx.llm.restructure_markdown(&retagged).await {
            Ok(Some(restructured)) if has_structural_headers(&restructured) => {
                normalize_whitespace(&restructured)
            }
            Ok(_) => retagged,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(document = %document_id, error = %e, "restructure failed, keeping flat text");
                retagged
            }
        }
    };

    sqlx::query(
        "UPDATE documents SET preprocessed_content = $2, current_step = 4, updated_at = now() WHERE id = $1",
    )
    .bind(document_id)
    .bind(&preprocessed)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// CRLF → LF, trailing spaces stripped, runs of three or more blank lines
/// collapsed to two.
pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Retag lines whose text matches the agenda taxonomy, and leave every other
/// existing header untouched.
pub fn retag_headers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let bare = line.trim_start_matches('#').trim();

        if let Some(caps) = item_re().captures(bare) {
            let kind = &caps[1];
            let number = &caps[2];
            let title = caps[3].trim();
            out.push_str(&format!("## {}안건 {}. {}", kind, number, title));
        } else if category_re().is_match(bare) {
            out.push_str(&format!("# {}", collapse_ws(bare)));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    out.trim_end().to_string()
}

/// At least one markdown header at any level.
pub fn has_structural_headers(text: &str) -> bool {
    text.lines().any(|l| header_re().is_match(l))
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// An agenda item line: `논의안건 1. 제목` (with or without spaces around
/// 안건 and with `.` or `)` after the number).
fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(보고|논의|의결|기타)\s*안건\s*(\d+)\s*[.)]\s*(.+)$").unwrap())
}

/// A bare category line: `논의안건`, `보고 안건` and so on, nothing after it.
fn category_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(보고|논의|의결|기타)\s*안건$").unwrap())
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s+\S").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_crlf_and_blank_runs() {
        let input = "첫 줄  \r\n\r\n\r\n\r\n둘째 줄\r\n";
        let out = normalize_whitespace(input);
        assert_eq!(out, "첫 줄\n\n\n둘째 줄");
    }

    #[test]
    fn normalize_strips_trailing_spaces() {
        assert_eq!(normalize_whitespace("a   \nb\t"), "a\nb");
    }

    #[test]
    fn retag_item_line() {
        let out = retag_headers("논의안건 1. 축제 예산");
        assert_eq!(out, "## 논의안건 1. 축제 예산");
    }

    #[test]
    fn retag_item_line_with_loose_spacing() {
        let out = retag_headers("의결 안건 2) 회칙 개정");
        assert_eq!(out, "## 의결안건 2. 회칙 개정");
    }

    #[test]
    fn retag_category_line() {
        assert_eq!(retag_headers("보고 안건"), "# 보고 안건");
        assert_eq!(retag_headers("기타안건"), "# 기타안건");
    }

    #[test]
    fn retag_fixes_wrong_level() {
        let out = retag_headers("# 논의안건 1. 축제 예산");
        assert_eq!(out, "## 논의안건 1. 축제 예산");
    }

    #[test]
    fn retag_leaves_other_headers_alone() {
        let input = "# 회의 개요\n본문\n## 기타 메모";
        assert_eq!(retag_headers(input), input);
    }

    #[test]
    fn header_detection() {
        assert!(has_structural_headers("## 논의안건 1. 축제 예산\n본문"));
        assert!(!has_structural_headers("머리글 없는 본문\n#해시태그"));
    }
}
