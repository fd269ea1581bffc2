//! Stage 2 — Classify.
//!
//! Two passes. The first is a regex taxonomy over the file name and path:
//! tokens like 안건 (agenda), 속기 (minutes), 결과 (result) trigger a meeting
//! subtype; extension and path tokens distinguish meeting, work, and other
//! documents. Only when the first pass is ambiguous does the LLM get a say,
//! and its answer is accepted only when it parses into the closed enums —
//! anything else falls back to `other_document`.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::StageResult;
use crate::models::{DocCategory, MeetingSubtype};

/// A candidate classification from either pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: DocCategory,
    pub subtype: Option<MeetingSubtype>,
    pub standardized_name: String,
    pub year: Option<i32>,
}

pub async fn run(ctx: &AppContext, document_id: Uuid) -> StageResult<()> {
    let row: (Option<String>, Option<String>) =
        sqlx::query_as("SELECT drive_name, path FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_one(&ctx.pool)
            .await?;

    let name = row.0.unwrap_or_default();
    let path = row.1.unwrap_or_default();

    let classification = match classify_by_rules(&name, &path) {
        Some(c) => c,
        None => classify_by_llm(ctx, &name, &path).await?,
    };

    sqlx::query(
        r#"
        UPDATE documents
        SET doc_category = $2, meeting_subtype = $3, standardized_name = $4,
            year = COALESCE($5, year), status = 'processing', current_step = 2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(classification.category.as_str())
    .bind(classification.subtype.map(|s| s.as_str()))
    .bind(&classification.standardized_name)
    .bind(classification.year)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// First pass: fixed taxonomy over name + path tokens. Returns `None` when
/// neither a meeting nor a work signal is present, which hands the decision
/// to the LLM pass.
pub fn classify_by_rules(file_name: &str, path: &str) -> Option<Classification> {
    let haystack = format!("{} {}", file_name, path);
    let standardized_name = standardize_name(file_name);
    let year = extract_year(&haystack);

    if let Some(subtype) = detect_subtype(&haystack) {
        return Some(Classification {
            category: DocCategory::MeetingDocument,
            subtype: Some(subtype),
            standardized_name,
            year,
        });
    }

    if meeting_re().is_match(&haystack) {
        return Some(Classification {
            category: DocCategory::MeetingDocument,
            subtype: None,
            standardized_name,
            year,
        });
    }

    if work_re().is_match(&haystack) {
        return Some(Classification {
            category: DocCategory::WorkDocument,
            subtype: None,
            standardized_name,
            year,
        });
    }

    None
}

/// Second pass: ask the LLM, then validate every field against the closed
/// enums before anything can be stored.
async fn classify_by_llm(
    ctx: &AppContext,
    file_name: &str,
    path: &str,
) -> StageResult<Classification> {
    let signal = ctx.llm.classify(file_name, path).await?;

    let category = signal
        .category
        .as_deref()
        .and_then(DocCategory::parse)
        .unwrap_or(DocCategory::OtherDocument);

    let subtype = signal
        .meeting_subtype
        .as_deref()
        .and_then(MeetingSubtype::parse)
        // A subtype only makes sense on a meeting document.
        .filter(|_| category == DocCategory::MeetingDocument);

    let standardized_name = signal
        .standardized_name
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| standardize_name(file_name));

    Ok(Classification {
        category,
        subtype,
        standardized_name,
        year: extract_year(&format!("{} {}", file_name, path)),
    })
}

/// Subtype keywords, checked in confidence order so a name carrying both
/// 결과 and 안건 resolves to the stronger signal.
pub fn detect_subtype(haystack: &str) -> Option<MeetingSubtype> {
    if result_re().is_match(haystack) {
        Some(MeetingSubtype::Result)
    } else if minutes_re().is_match(haystack) {
        Some(MeetingSubtype::Minutes)
    } else if agenda_re().is_match(haystack) {
        Some(MeetingSubtype::Agenda)
    } else {
        None
    }
}

/// Strip bracketed prefixes and the extension: `[안건지] 5차회의.docx` →
/// `5차회의`.
pub fn standardize_name(file_name: &str) -> String {
    let without_ext = match file_name.rfind('.') {
        Some(dot) if dot > 0 => &file_name[..dot],
        _ => file_name,
    };
    let stripped = bracket_prefix_re().replace_all(without_ext, "");
    collapse_ws(stripped.trim())
}

pub fn extract_year(haystack: &str) -> Option<i32> {
    year_re()
        .captures(haystack)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"결과|result").unwrap())
}

fn minutes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"속기|회의록|minutes").unwrap())
}

fn agenda_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"안건|agenda").unwrap())
}

fn meeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"회의|총회|meeting").unwrap())
}

fn work_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"계획|보고서|공문|기획|예산안|신청|품의").unwrap())
}

fn bracket_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[\[(][^\])]*[\])]\s*").unwrap())
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})\b").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agenda_minutes_result_triplet() {
        let agenda = classify_by_rules("[안건지] 5차회의.docx", "2025/회의").unwrap();
        assert_eq!(agenda.category, DocCategory::MeetingDocument);
        assert_eq!(agenda.subtype, Some(MeetingSubtype::Agenda));
        assert_eq!(agenda.standardized_name, "5차회의");
        assert_eq!(agenda.year, Some(2025));

        let minutes = classify_by_rules("[속기록] 5차회의.docx", "").unwrap();
        assert_eq!(minutes.subtype, Some(MeetingSubtype::Minutes));

        let result = classify_by_rules("[결과지] 5차회의.docx", "").unwrap();
        assert_eq!(result.subtype, Some(MeetingSubtype::Result));
    }

    #[test]
    fn result_outranks_agenda_in_same_name() {
        assert_eq!(
            detect_subtype("5차회의 안건 처리결과"),
            Some(MeetingSubtype::Result)
        );
    }

    #[test]
    fn meeting_without_subtype() {
        let c = classify_by_rules("정기회의 참고자료.pdf", "").unwrap();
        assert_eq!(c.category, DocCategory::MeetingDocument);
        assert_eq!(c.subtype, None);
    }

    #[test]
    fn work_document_tokens() {
        let c = classify_by_rules("2024 축제 기획 보고서.docx", "행사").unwrap();
        assert_eq!(c.category, DocCategory::WorkDocument);
        assert_eq!(c.year, Some(2024));
    }

    #[test]
    fn ambiguous_name_defers_to_llm() {
        assert!(classify_by_rules("사진모음.zip", "기타").is_none());
    }

    #[test]
    fn standardize_strips_brackets_and_extension() {
        assert_eq!(standardize_name("[안건지] 5차회의.docx"), "5차회의");
        assert_eq!(standardize_name("(참고) 예산  내역.xlsx"), "예산 내역");
        assert_eq!(standardize_name("no_extension"), "no_extension");
    }

    #[test]
    fn year_extraction() {
        assert_eq!(extract_year("2025/행사/문서.docx"), Some(2025));
        assert_eq!(extract_year("문서 1999.docx"), None);
    }
}
