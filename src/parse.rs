//! Stage 3 — Parse.
//!
//! Sends the materialized file to the document parser, uploads every
//! extracted image to the bucket under `images/<drive_id>/<asset_id>.png`,
//! captions it through the vision model, and splices the caption into the
//! markdown where the asset placeholder sat. Captions are wrapped in a
//! deterministic fence so downstream consumers can tell synthesized text
//! from source text.
//!
//! Caption calls fan out under the stage semaphore; the LLM token bucket
//! still serializes actual requests to the configured rate.

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::AppContext;
use crate::docparser::{AssetKind, ParsedAsset};
use crate::error::{PipelineError, StageResult};
use crate::llm::CaptionHint;

const CAPTION_OPEN: &str = "<!-- synthesized-caption asset=";
const CAPTION_CLOSE: &str = "<!-- /synthesized-caption -->";

pub async fn run(ctx: &AppContext, document_id: Uuid) -> StageResult<()> {
    let row: (Option<String>, Option<String>, serde_json::Value) = sqlx::query_as(
        "SELECT drive_id, drive_name, metadata FROM documents WHERE id = $1",
    )
    .bind(document_id)
    .fetch_one(&ctx.pool)
    .await?;

    let drive_id = row.0.unwrap_or_else(|| document_id.to_string());
    let file_name = row.1.unwrap_or_else(|| "document".to_string());
    let bytes = load_original(ctx, &row.2, &drive_id, &file_name).await?;

    let parsed = ctx.parser.parse(&file_name, &bytes).await?;

    if parsed.markdown.trim().is_empty() && parsed.assets.is_empty() {
        return Err(PipelineError::stage(
            "parse",
            format!("ParseEmpty: no text extracted from {}", file_name),
        ));
    }

    let raw_markdown = parsed.markdown.clone();
    let merged = merge_captions(ctx, &drive_id, parsed.markdown, parsed.assets).await?;

    if merged.trim().is_empty() {
        return Err(PipelineError::stage(
            "parse",
            format!("ParseEmpty: nothing left after caption merge for {}", file_name),
        ));
    }

    sqlx::query(
        r#"
        UPDATE documents
        SET raw_content = $2, parsed_content = $3, current_step = 3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(&raw_markdown)
    .bind(&merged)
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// Prefer the scratch copy from Stage 1; fall back to the durable original.
async fn load_original(
    ctx: &AppContext,
    metadata: &serde_json::Value,
    drive_id: &str,
    file_name: &str,
) -> StageResult<Vec<u8>> {
    if let Some(path) = metadata.get("local_path").and_then(|v| v.as_str()) {
        if let Ok(bytes) = std::fs::read(path) {
            return Ok(bytes);
        }
    }

    let key = format!("originals/{}/{}", drive_id, file_name);
    ctx.storage
        .get(&key)
        .await
        .map_err(|e| PipelineError::stage("parse", format!("original unavailable: {}", e)))
}

/// Upload assets, caption them, and substitute the placeholders.
async fn merge_captions(
    ctx: &AppContext,
    drive_id: &str,
    markdown: String,
    assets: Vec<ParsedAsset>,
) -> StageResult<String> {
    if assets.is_empty() {
        return Ok(markdown);
    }

    let mut tasks: JoinSet<(String, StageResult<String>)> = JoinSet::new();

    for asset in assets {
        let llm = ctx.llm.clone();
        let storage = ctx.storage.clone();
        let semaphore = ctx.stage_semaphore.clone();
        let drive_id = drive_id.to_string();

        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.expect("stage semaphore closed");
            let key = format!("images/{}/{}.png", drive_id, asset.id);
            if let Err(e) = storage.put(&key, asset.bytes.clone(), "image/png").await {
                tracing::warn!(asset = %asset.id, error = %e, "asset upload failed");
            }

            let hint = match asset.kind {
                AssetKind::Table => CaptionHint::Table,
                AssetKind::Image => CaptionHint::Pictorial,
            };
            let caption = llm.caption(&asset.bytes, hint).await;
            (asset.id, caption)
        });
    }

    let mut merged = markdown;
    while let Some(joined) = tasks.join_next().await {
        let (asset_id, caption) = joined
            .map_err(|e| PipelineError::stage("parse", format!("caption task panicked: {}", e)))?;
        let caption = caption?;
        merged = splice_caption(&merged, &asset_id, &caption);
    }

    Ok(merged)
}

/// Replace `![](asset://<id>)` with the fenced caption. When the parser
/// produced no placeholder the caption is appended so it still becomes
/// searchable text.
pub fn splice_caption(markdown: &str, asset_id: &str, caption: &str) -> String {
    let fenced = format!(
        "{}{} -->\n{}\n{}",
        CAPTION_OPEN, asset_id, caption.trim(), CAPTION_CLOSE
    );
    let placeholder = format!("![](asset://{})", asset_id);

    if markdown.contains(&placeholder) {
        markdown.replace(&placeholder, &fenced)
    } else {
        let mut out = markdown.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&fenced);
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_replaces_placeholder() {
        let md = "서문\n\n![](asset://img1)\n\n본문";
        let out = splice_caption(md, "img1", "| 항목 | 금액 |\n| 예산 | 100 |");
        assert!(!out.contains("asset://img1"));
        assert!(out.contains("synthesized-caption asset=img1"));
        assert!(out.contains("| 항목 | 금액 |"));
        assert!(out.contains(CAPTION_CLOSE));
    }

    #[test]
    fn caption_appends_without_placeholder() {
        let out = splice_caption("본문만 있음", "img9", "그림 설명");
        assert!(out.starts_with("본문만 있음"));
        assert!(out.contains("synthesized-caption asset=img9"));
        assert!(out.trim_end().ends_with(CAPTION_CLOSE));
    }

    #[test]
    fn fence_is_deterministic() {
        let a = splice_caption("x ![](asset://a)", "a", "cap");
        let b = splice_caption("x ![](asset://a)", "a", "cap");
        assert_eq!(a, b);
    }
}
