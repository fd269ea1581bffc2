//! Core data models used throughout Docket.
//!
//! These types represent the events, documents, chunks, and chat turns that
//! flow through the ingestion pipeline and the retrieval engine. Enum-valued
//! columns are stored as text; the closed enums here are the only values that
//! can be written, and anything an LLM returns is validated against them
//! before it can be stored.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical embedding dimensionality. Pinned at build time; the vector
/// column, the HNSW index, and the embedder contract all agree on it.
pub const EMBEDDING_DIM: usize = 768;

// ============ Closed enums ============

/// File format family of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    WordProcessor,
    Spreadsheet,
    Slides,
    Pdf,
    Hwp,
    Hwpx,
    Text,
    Csv,
    Image,
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::WordProcessor => "word_processor",
            DocType::Spreadsheet => "spreadsheet",
            DocType::Slides => "slides",
            DocType::Pdf => "pdf",
            DocType::Hwp => "hwp",
            DocType::Hwpx => "hwpx",
            DocType::Text => "text",
            DocType::Csv => "csv",
            DocType::Image => "image",
            DocType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "word_processor" => Some(DocType::WordProcessor),
            "spreadsheet" => Some(DocType::Spreadsheet),
            "slides" => Some(DocType::Slides),
            "pdf" => Some(DocType::Pdf),
            "hwp" => Some(DocType::Hwp),
            "hwpx" => Some(DocType::Hwpx),
            "text" => Some(DocType::Text),
            "csv" => Some(DocType::Csv),
            "image" => Some(DocType::Image),
            "other" => Some(DocType::Other),
            _ => None,
        }
    }
}

/// Top-level document category assigned by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocCategory {
    MeetingDocument,
    WorkDocument,
    OtherDocument,
}

impl DocCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocCategory::MeetingDocument => "meeting_document",
            DocCategory::WorkDocument => "work_document",
            DocCategory::OtherDocument => "other_document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "meeting_document" => Some(DocCategory::MeetingDocument),
            "work_document" => Some(DocCategory::WorkDocument),
            "other_document" => Some(DocCategory::OtherDocument),
            _ => None,
        }
    }
}

/// Meeting document subtype. Carries a confidence ordering used as a
/// retrieval tie-breaker: a result sheet outranks minutes outranks an agenda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingSubtype {
    Agenda,
    Minutes,
    Result,
}

impl MeetingSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingSubtype::Agenda => "agenda",
            MeetingSubtype::Minutes => "minutes",
            MeetingSubtype::Result => "result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agenda" => Some(MeetingSubtype::Agenda),
            "minutes" => Some(MeetingSubtype::Minutes),
            "result" => Some(MeetingSubtype::Result),
            _ => None,
        }
    }

    /// Tie-breaker rank: result(3) > minutes(2) > agenda(1).
    pub fn rank(&self) -> i32 {
        match self {
            MeetingSubtype::Result => 3,
            MeetingSubtype::Minutes => 2,
            MeetingSubtype::Agenda => 1,
        }
    }
}

/// Pipeline lifecycle of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Processing => "processing",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PipelineStatus::Pending),
            "processing" => Some(PipelineStatus::Processing),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }
}

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Planned => "planned",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(EventStatus::Planned),
            "in_progress" => Some(EventStatus::InProgress),
            "completed" => Some(EventStatus::Completed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

/// Kind of content a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Table,
    ImageCaption,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Table => "table",
            ChunkType::ImageCaption => "image_caption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChunkType::Text),
            "table" => Some(ChunkType::Table),
            "image_caption" => Some(ChunkType::ImageCaption),
            _ => None,
        }
    }
}

// ============ Entities ============

/// A logical happening (a festival, a council meeting series) that chunks map
/// to N:M. Created on first reference by enrichment, mutated by later
/// enrichments, never deleted by the pipeline.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub year: Option<i32>,
    pub event_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub category: Option<String>,
    pub department: Option<String>,
    pub status: EventStatus,
    /// Per-meeting chunk timeline, filled by enrichment.
    pub chunk_timeline: serde_json::Value,
    pub decision_summaries: serde_json::Value,
    pub action_items: serde_json::Value,
    pub parent_chunk_ids: serde_json::Value,
    pub child_chunk_ids: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single file known to the system.
///
/// `event_id` is informational; true event anchoring happens per chunk.
/// `current_step` is the last successfully completed stage (0..=7) and only
/// regresses through an explicit reprocess that also clears downstream
/// fields.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub drive_id: Option<String>,
    pub drive_name: Option<String>,
    pub display_name: Option<String>,
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub storage_url: Option<String>,
    pub doc_type: DocType,
    pub doc_category: Option<DocCategory>,
    pub meeting_subtype: Option<MeetingSubtype>,
    /// 1 = most restricted, 4 = broadly readable.
    pub access_level: i32,
    pub standardized_name: Option<String>,
    pub time_decay_date: Option<NaiveDate>,
    pub department: Option<String>,
    pub year: Option<i32>,
    pub status: PipelineStatus,
    pub raw_content: Option<String>,
    pub parsed_content: Option<String>,
    pub preprocessed_content: Option<String>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub current_step: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of retrieval.
///
/// Parents carry the full text of one agenda-item section; children are the
/// embeddable windows cut from it. `parent_content` is denormalized onto
/// children so retrieval can assemble context without a join.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub parent_chunk_id: Option<Uuid>,
    pub related_event_id: Option<Uuid>,
    pub inferred_event_title: Option<String>,
    pub is_parent: bool,
    pub chunk_index: i32,
    pub chunk_type: ChunkType,
    pub content: String,
    pub parent_content: String,
    pub section_header: Option<String>,
    /// `None` until Stage 7 writes the vector. Parents stay `None`.
    pub embedding: Option<Vec<f32>>,
    pub access_level: i32,
    pub metadata: serde_json::Value,
    pub token_count: i32,
    pub start_char: i32,
    pub end_char: i32,
}

impl DocumentChunk {
    /// `is_parent ⇔ parent_chunk_id IS NULL`. A violation is a bug, not a
    /// recoverable error.
    pub fn assert_hierarchy_invariant(&self) {
        assert_eq!(
            self.is_parent,
            self.parent_chunk_id.is_none(),
            "chunk {} violates is_parent/parent_chunk_id invariant",
            self.id
        );
    }
}

/// A link-only record for sensitive or non-parseable sources. Never parsed,
/// never embedded.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceLink {
    pub id: Uuid,
    pub description: Option<String>,
    pub url: String,
    pub file_type: Option<String>,
    pub file_name: String,
    pub access_level: i32,
    pub event_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One chat turn, persisted append-only for analytics.
#[derive(Debug, Clone)]
pub struct ChatLog {
    pub id: Uuid,
    pub session_id: String,
    pub user_level: i32,
    pub query: String,
    pub rewritten_query: Option<String>,
    pub response: Option<String>,
    pub chunks: serde_json::Value,
    pub sources: serde_json::Value,
    pub turn_index: i32,
    pub retrieval_ms: i64,
    pub generation_ms: i64,
    pub total_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Raw record produced by the drive sync for one materialized file.
#[derive(Debug, Clone)]
pub struct DriveFile {
    pub drive_id: String,
    /// Real file name on the drive, not the local export name.
    pub name: String,
    pub mime_type: String,
    pub size: Option<i64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub web_link: Option<String>,
    pub local_path: Option<std::path::PathBuf>,
    /// True when the file's export type is on the ignore list; Stage 1
    /// routes these to `reference_links` instead of `documents`.
    pub skipped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_roundtrip() {
        for s in ["agenda", "minutes", "result"] {
            assert_eq!(MeetingSubtype::parse(s).unwrap().as_str(), s);
        }
        for s in ["meeting_document", "work_document", "other_document"] {
            assert_eq!(DocCategory::parse(s).unwrap().as_str(), s);
        }
        assert!(MeetingSubtype::parse("transcript").is_none());
        assert!(DocCategory::parse("unknown").is_none());
    }

    #[test]
    fn subtype_rank_ordering() {
        assert!(MeetingSubtype::Result.rank() > MeetingSubtype::Minutes.rank());
        assert!(MeetingSubtype::Minutes.rank() > MeetingSubtype::Agenda.rank());
    }

    #[test]
    #[should_panic]
    fn hierarchy_invariant_panics_on_violation() {
        let chunk = DocumentChunk {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            parent_chunk_id: Some(Uuid::new_v4()),
            related_event_id: None,
            inferred_event_title: None,
            is_parent: true,
            chunk_index: 0,
            chunk_type: ChunkType::Text,
            content: String::new(),
            parent_content: String::new(),
            section_header: None,
            embedding: None,
            access_level: 1,
            metadata: serde_json::json!({}),
            token_count: 0,
            start_char: 0,
            end_char: 0,
        };
        chunk.assert_hierarchy_invariant();
    }
}
