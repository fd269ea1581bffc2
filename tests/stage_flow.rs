//! End-to-end flow of the database-free pipeline stages: classification →
//! preprocessing → chunking, driven over a meeting-document triplet the way
//! a folder scan would feed them.

use docket::chunk::{build_chunks, split_sections};
use docket::classify::{classify_by_rules, standardize_name};
use docket::enrich::{access_level_for, normalize_title, similarity_ratio};
use docket::models::{DocCategory, MeetingSubtype};
use docket::preprocess::{has_structural_headers, normalize_whitespace, retag_headers};
use uuid::Uuid;

const AGENDA_FILE: &str = "[안건지] 5차회의.docx";
const MINUTES_FILE: &str = "[속기록] 5차회의.docx";
const RESULT_FILE: &str = "[결과지] 5차회의.docx";

/// What the parser + preprocess input looks like for the triplet: one shared
/// agenda item.
const MEETING_BODY: &str = "\
회의 개요\r\n\r\n\r\n\r\n\
논의안건 1. 축제 예산\r\n\
무대 설치 비용은 300만원으로 책정한다.   \r\n\
홍보물 제작은 50만원 한도로 집행한다.\r\n";

fn preprocess(raw: &str) -> String {
    retag_headers(&normalize_whitespace(raw))
}

#[test]
fn triplet_classifies_into_three_subtypes() {
    let agenda = classify_by_rules(AGENDA_FILE, "2025/정기회의").unwrap();
    let minutes = classify_by_rules(MINUTES_FILE, "2025/정기회의").unwrap();
    let result = classify_by_rules(RESULT_FILE, "2025/정기회의").unwrap();

    for c in [&agenda, &minutes, &result] {
        assert_eq!(c.category, DocCategory::MeetingDocument);
        assert_eq!(c.standardized_name, "5차회의");
        assert_eq!(c.year, Some(2025));
    }
    assert_eq!(agenda.subtype, Some(MeetingSubtype::Agenda));
    assert_eq!(minutes.subtype, Some(MeetingSubtype::Minutes));
    assert_eq!(result.subtype, Some(MeetingSubtype::Result));
}

#[test]
fn triplet_access_levels_follow_policy() {
    let result_level = access_level_for(
        Some(DocCategory::MeetingDocument),
        Some(MeetingSubtype::Result),
        1,
    );
    let minutes_level = access_level_for(
        Some(DocCategory::MeetingDocument),
        Some(MeetingSubtype::Minutes),
        1,
    );
    let agenda_level = access_level_for(
        Some(DocCategory::MeetingDocument),
        Some(MeetingSubtype::Agenda),
        1,
    );
    assert_eq!(result_level, 4);
    assert_eq!(minutes_level, 3);
    assert_eq!(agenda_level, 3);
}

#[test]
fn preprocess_produces_the_agenda_header() {
    let text = preprocess(MEETING_BODY);
    assert!(has_structural_headers(&text));
    assert!(text.contains("## 논의안건 1. 축제 예산"));
    assert!(!text.contains('\r'));
    assert!(!text.contains("\n\n\n\n"));
}

#[test]
fn chunking_anchors_every_child_to_the_agenda_item() {
    let text = preprocess(MEETING_BODY);
    let groups = build_chunks(Uuid::new_v4(), 3, &text);

    let budget_group = groups
        .iter()
        .find(|(p, _)| p.section_header.as_deref() == Some("## 논의안건 1. 축제 예산"))
        .expect("agenda item must become a parent chunk");

    let (parent, children) = budget_group;
    assert!(parent.is_parent);
    assert!(parent.content.contains("무대 설치 비용"));
    assert!(!children.is_empty());
    for child in children {
        assert_eq!(child.parent_chunk_id, Some(parent.id));
        assert_eq!(child.parent_content, parent.content);
        assert_eq!(child.access_level, 3);
    }
}

#[test]
fn searching_phrase_lives_in_parent_content() {
    let text = preprocess(MEETING_BODY);
    let groups = build_chunks(Uuid::new_v4(), 3, &text);
    let found = groups.iter().any(|(_, children)| {
        children
            .iter()
            .any(|c| c.parent_content.contains("축제 예산"))
    });
    assert!(found, "every child under the agenda item carries the phrase via parent_content");
}

#[test]
fn headerless_document_degenerates_to_one_parent() {
    let raw = "머리글 없는 공지입니다.\r\n내용이 이어집니다.";
    let text = preprocess(raw);
    let groups = build_chunks(Uuid::new_v4(), 1, &text);
    assert_eq!(groups.len(), 1);
    let (parent, children) = &groups[0];
    assert!(parent.section_header.is_none());
    assert!(!children.is_empty());
}

#[test]
fn long_section_windows_keep_document_order() {
    let body: String = (0..200)
        .map(|i| format!("안건 세부 항목 {}번에 대한 설명입니다. ", i))
        .collect();
    let raw = format!("## 논의안건 1. 긴 안건\n{}", body);
    let groups = build_chunks(Uuid::new_v4(), 2, &raw);
    let (_, children) = &groups[0];

    assert!(children.len() > 3);
    for pair in children.windows(2) {
        assert!(pair[0].chunk_index < pair[1].chunk_index);
        assert!(pair[0].start_char <= pair[1].start_char);
    }
}

#[test]
fn section_split_respects_both_header_levels() {
    let text = "# 보고 안건\n## 보고안건 1. 경과 보고\n내용 하나\n# 논의 안건\n## 논의안건 1. 축제 예산\n내용 둘";
    let sections = split_sections(text);
    let headers: Vec<_> = sections.iter().filter_map(|s| s.header.clone()).collect();
    assert_eq!(
        headers,
        vec!["## 보고안건 1. 경과 보고", "## 논의안건 1. 축제 예산"]
    );
}

#[test]
fn event_title_matching_tolerates_small_variations() {
    let a = normalize_title("1. 5차회의");
    let b = normalize_title("5차회의");
    assert_eq!(a, b);
    assert!(similarity_ratio("2025 대동제 기획", "2025 대동제 기획안") >= 0.85);
    assert!(similarity_ratio("체육대회", "대동제") < 0.85);
}

#[test]
fn standardized_names_unify_the_triplet() {
    let names: Vec<String> = [AGENDA_FILE, MINUTES_FILE, RESULT_FILE]
        .iter()
        .map(|f| standardize_name(f))
        .collect();
    assert!(names.iter().all(|n| n == "5차회의"));
}
