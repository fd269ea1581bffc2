//! Document listing and lookup, shared by the CLI and the HTTP server.

use anyhow::Result;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::PipelineStatus;

/// Row summary for `GET /documents` and `docket documents`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub drive_id: Option<String>,
    pub drive_name: Option<String>,
    pub standardized_name: Option<String>,
    pub doc_category: Option<String>,
    pub meeting_subtype: Option<String>,
    pub access_level: i32,
    pub year: Option<i32>,
    pub status: String,
    pub current_step: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentPage {
    pub total: i64,
    pub documents: Vec<DocumentSummary>,
}

pub async fn list_documents(
    pool: &PgPool,
    skip: i64,
    limit: i64,
    status: Option<PipelineStatus>,
) -> Result<DocumentPage> {
    let status_str = status.map(|s| s.as_str());

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM documents WHERE ($1::text IS NULL OR status = $1)",
    )
    .bind(status_str)
    .fetch_one(pool)
    .await?;

    let rows = sqlx::query(
        r#"
        SELECT id, drive_id, drive_name, standardized_name, doc_category, meeting_subtype,
               access_level, year, status, current_step, error_message, processed_at
        FROM documents
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at DESC
        OFFSET $2 LIMIT $3
        "#,
    )
    .bind(status_str)
    .bind(skip.max(0))
    .bind(limit.clamp(1, 500))
    .fetch_all(pool)
    .await?;

    let documents = rows
        .iter()
        .map(|row| DocumentSummary {
            id: row.get("id"),
            drive_id: row.get("drive_id"),
            drive_name: row.get("drive_name"),
            standardized_name: row.get("standardized_name"),
            doc_category: row.get("doc_category"),
            meeting_subtype: row.get("meeting_subtype"),
            access_level: row.get("access_level"),
            year: row.get("year"),
            status: row.get("status"),
            current_step: row.get("current_step"),
            error_message: row.get("error_message"),
            processed_at: row.get("processed_at"),
        })
        .collect();

    Ok(DocumentPage { total, documents })
}
