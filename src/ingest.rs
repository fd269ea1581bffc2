//! Stage 1 — Ingest.
//!
//! Mirrors a drive folder into the per-run scratch directory, uploads
//! originals to the bucket, and registers each accepted file as a `Document`
//! row in status `pending` with `current_step = 1`. Upserts are keyed by
//! `drive_id`: a second ingestion of the same file updates the existing row
//! instead of duplicating it, and an unchanged completed document is left
//! alone entirely so re-running a folder scan is a no-op.
//!
//! Files whose export type is on the ignore list (online forms) become
//! `reference_links` rows with their link and name, never documents.

use sqlx::Row;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{PipelineError, StageResult};
use crate::models::{DocType, DriveFile};

/// What a folder scan produced. `document_ids` lists the documents that need
/// a pipeline run (new or changed); unchanged completed documents and
/// documents still mid-pipeline are not in it.
#[derive(Debug, Default)]
pub struct FolderScanOutcome {
    pub document_ids: Vec<Uuid>,
    pub documents_found: u64,
    pub references_written: u64,
    pub unchanged: u64,
    pub purged: u64,
}

/// Options for one folder scan.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScanOptions {
    /// Delete documents whose drive id no longer exists remotely. Off by
    /// default.
    #[serde(default)]
    pub reconcile_missing: bool,
}

/// Run Stage 1 for a folder. On sync failure the scan aborts, but the files
/// already registered are returned inside the error-free partial outcome by
/// the caller holding the progress record — here the sync either succeeds as
/// a whole or fails before anything was written.
pub async fn scan_folder(
    ctx: &AppContext,
    folder_id: &str,
    run_id: &str,
    options: &ScanOptions,
) -> StageResult<FolderScanOutcome> {
    let files = ctx.drive.sync(folder_id, &ctx.storage, run_id).await?;

    let mut outcome = FolderScanOutcome::default();
    let mut seen_drive_ids: Vec<String> = Vec::with_capacity(files.len());

    for file in &files {
        seen_drive_ids.push(file.drive_id.clone());

        if file.skipped {
            write_reference(ctx, file).await?;
            outcome.references_written += 1;
            continue;
        }

        match register_document(ctx, folder_id, file).await {
            Ok(Some(id)) => {
                outcome.document_ids.push(id);
                outcome.documents_found += 1;
            }
            Ok(None) => {
                outcome.unchanged += 1;
                outcome.documents_found += 1;
            }
            Err(e) => {
                // Per-file registration problems degrade to a warning; the
                // rest of the folder continues.
                tracing::warn!(drive_id = %file.drive_id, error = %e, "file registration failed");
            }
        }
    }

    if options.reconcile_missing {
        outcome.purged = purge_missing(ctx, &seen_drive_ids).await?;
    }

    tracing::info!(
        folder = folder_id,
        found = outcome.documents_found,
        queued = outcome.document_ids.len(),
        references = outcome.references_written,
        "folder scan complete"
    );
    Ok(outcome)
}

/// Upsert one file. Returns `Some(id)` when the document needs a pipeline
/// run, `None` when it is unchanged and already completed, or when it is
/// mid-pipeline. A processing document keeps its `current_step` untouched —
/// `current_step` only regresses through the explicit reprocess path, which
/// also clears the downstream fields. The next scan picks the file up again
/// once its pipeline has settled.
async fn register_document(
    ctx: &AppContext,
    folder_path: &str,
    file: &DriveFile,
) -> StageResult<Option<Uuid>> {
    let modified = file.modified_time.map(|t| t.to_rfc3339());

    let existing = sqlx::query(
        "SELECT id, status, metadata->>'drive_modified_time' AS modified FROM documents WHERE drive_id = $1",
    )
    .bind(&file.drive_id)
    .fetch_optional(&ctx.pool)
    .await?;

    if let Some(row) = &existing {
        let status: String = row.get("status");
        let stored_modified: Option<String> = row.get("modified");
        if status == "completed" && stored_modified == modified {
            return Ok(None);
        }
        if status == "processing" {
            tracing::info!(drive_id = %file.drive_id, "document mid-pipeline, leaving untouched");
            return Ok(None);
        }
    }

    // Durable original. Best-effort: a bucket hiccup must not lose the file
    // registration, the local copy still feeds the parser.
    let storage_url = match upload_original(ctx, file).await {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(drive_id = %file.drive_id, error = %e, "original upload failed");
            None
        }
    };

    let metadata = serde_json::json!({
        "drive_modified_time": modified,
        "web_link": file.web_link,
        "size": file.size,
        "local_path": file.local_path.as_ref().map(|p| p.display().to_string()),
    });

    let doc_id = existing
        .map(|row| row.get::<Uuid, _>("id"))
        .unwrap_or_else(Uuid::new_v4);

    sqlx::query(
        r#"
        INSERT INTO documents (id, drive_id, drive_name, path, mime_type, storage_url,
                               doc_type, status, metadata, current_step, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, 1, now())
        ON CONFLICT (drive_id) DO UPDATE SET
            drive_name = excluded.drive_name,
            path = excluded.path,
            mime_type = excluded.mime_type,
            storage_url = COALESCE(excluded.storage_url, documents.storage_url),
            doc_type = excluded.doc_type,
            status = 'pending',
            metadata = excluded.metadata,
            current_step = 1,
            error_message = NULL,
            updated_at = now()
        "#,
    )
    .bind(doc_id)
    .bind(&file.drive_id)
    .bind(&file.name)
    .bind(folder_path)
    .bind(&file.mime_type)
    .bind(&storage_url)
    .bind(doc_type_for_mime(&file.mime_type).as_str())
    .bind(&metadata)
    .execute(&ctx.pool)
    .await?;

    Ok(Some(doc_id))
}

async fn upload_original(ctx: &AppContext, file: &DriveFile) -> StageResult<Option<String>> {
    let Some(local_path) = &file.local_path else {
        return Ok(None);
    };
    let bytes = std::fs::read(local_path)
        .map_err(|e| PipelineError::stage("ingest", format!("scratch read: {}", e)))?;
    let key = format!("originals/{}/{}", file.drive_id, file.name);
    let url = ctx
        .storage
        .put(&key, bytes, &file.mime_type)
        .await
        .map_err(|e| PipelineError::stage("ingest", e.to_string()))?;
    Ok(Some(url))
}

async fn write_reference(ctx: &AppContext, file: &DriveFile) -> StageResult<()> {
    let url = file
        .web_link
        .clone()
        .unwrap_or_else(|| format!("drive://{}", file.drive_id));

    sqlx::query(
        r#"
        INSERT INTO reference_links (id, description, url, file_type, file_name, access_level)
        VALUES ($1, $2, $3, $4, $5, 1)
        ON CONFLICT (url) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(format!("ingest-excluded: {}", file.mime_type))
    .bind(url)
    .bind(&file.mime_type)
    .bind(&file.name)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// Optional reconciliation: remove documents whose drive id vanished.
async fn purge_missing(ctx: &AppContext, seen: &[String]) -> StageResult<u64> {
    let result = sqlx::query(
        "DELETE FROM documents WHERE drive_id IS NOT NULL AND NOT (drive_id = ANY($1))",
    )
    .bind(seen)
    .execute(&ctx.pool)
    .await?;
    Ok(result.rows_affected())
}

/// Map a MIME type to the document format family.
pub fn doc_type_for_mime(mime: &str) -> DocType {
    match mime {
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/msword" => DocType::WordProcessor,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.ms-excel" => DocType::Spreadsheet,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        | "application/vnd.ms-powerpoint" => DocType::Slides,
        "application/pdf" => DocType::Pdf,
        "application/x-hwp" | "application/haansofthwp" => DocType::Hwp,
        "application/x-hwpx" | "application/haansofthwpx" => DocType::Hwpx,
        "text/plain" | "text/markdown" => DocType::Text,
        "text/csv" => DocType::Csv,
        m if m.starts_with("image/") => DocType::Image,
        _ => DocType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_mapping_covers_office_formats() {
        assert_eq!(
            doc_type_for_mime(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            ),
            DocType::WordProcessor
        );
        assert_eq!(
            doc_type_for_mime("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
            DocType::Spreadsheet
        );
        assert_eq!(doc_type_for_mime("application/pdf"), DocType::Pdf);
        assert_eq!(doc_type_for_mime("application/x-hwp"), DocType::Hwp);
        assert_eq!(doc_type_for_mime("image/png"), DocType::Image);
        assert_eq!(doc_type_for_mime("application/zip"), DocType::Other);
    }
}
