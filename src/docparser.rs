//! Document parser adapter.
//!
//! Posts file bytes to the parsing service and returns a single markdown
//! string plus extracted image/table assets. The service's response shape is
//! not stable, so decoding is defensive: the known alternatives are accepted
//! and anything else is rejected as a permanent upstream failure rather than
//! guessed at.
//!
//! Accepted shapes for the document payload:
//!
//! | Shape | Example |
//! |-------|---------|
//! | raw string | `"# 제목\n..."` |
//! | markdown dict | `{"markdown": "..."}` |
//! | text dict | `{"text": "..."}` |
//! | nested content | `{"content": {"markdown": "..."}}` (or `text`/`html`) |
//! | list of parts | `[{"markdown": "..."}, {"text": "..."}]` |
//!
//! When markdown is empty but HTML is present, a minimal HTML → markdown
//! conversion is applied before the caller sees the result.

use base64::Engine;
use std::time::Duration;

use crate::config::ParserConfig;
use crate::error::{classify_status, PipelineError, StageResult};

/// One extracted visual asset (image or table region).
#[derive(Debug, Clone)]
pub struct ParsedAsset {
    pub id: String,
    pub kind: AssetKind,
    pub page: Option<i32>,
    pub bbox: Option<[f64; 4]>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Table,
}

/// Parser output: merged markdown plus asset records keyed by the
/// `![](asset://<id>)` placeholders the markdown contains.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub markdown: String,
    pub assets: Vec<ParsedAsset>,
}

#[derive(Clone)]
pub struct DocParser {
    config: ParserConfig,
    client: reqwest::Client,
}

impl DocParser {
    pub fn new(config: &ParserConfig) -> StageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ExternalPermanent(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// Parse one file. Retries transient failures (3 attempts, backoff).
    pub async fn parse(&self, file_name: &str, bytes: &[u8]) -> StageResult<ParsedDocument> {
        let url = format!("{}/parse", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "file_name": file_name,
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
        });

        let mut last_err: Option<PipelineError> = None;

        for attempt in 0..3u32 {
            if attempt > 0 {
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(60));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            PipelineError::ExternalPermanent(format!("parser body: {}", e))
                        })?;
                        return decode_response(&json);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = classify_status(status, &body_text);
                    if err.is_retryable() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(PipelineError::ExternalTemporary(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::ExternalTemporary("parser retries exhausted".into())))
    }
}

/// Decode the full service response: document payload + assets.
pub fn decode_response(json: &serde_json::Value) -> StageResult<ParsedDocument> {
    let document = json.get("document").unwrap_or(json);
    let markdown = decode_document_payload(document)?;
    let assets = decode_assets(json)?;
    Ok(ParsedDocument { markdown, assets })
}

/// Accept the closed set of payload shapes; reject anything else.
fn decode_document_payload(value: &serde_json::Value) -> StageResult<String> {
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }

    if let Some(obj) = value.as_object() {
        if let Some(md) = obj.get("markdown").and_then(|v| v.as_str()) {
            if md.trim().is_empty() {
                if let Some(html) = obj.get("html").and_then(|v| v.as_str()) {
                    if !html.trim().is_empty() {
                        return Ok(html_to_markdown(html));
                    }
                }
            }
            return Ok(md.to_string());
        }
        if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
            return Ok(text.to_string());
        }
        if let Some(content) = obj.get("content") {
            if let Some(inner) = content.as_object() {
                if let Some(md) = inner.get("markdown").and_then(|v| v.as_str()) {
                    if !md.trim().is_empty() {
                        return Ok(md.to_string());
                    }
                }
                if let Some(text) = inner.get("text").and_then(|v| v.as_str()) {
                    if !text.trim().is_empty() {
                        return Ok(text.to_string());
                    }
                }
                if let Some(html) = inner.get("html").and_then(|v| v.as_str()) {
                    if !html.trim().is_empty() {
                        return Ok(html_to_markdown(html));
                    }
                }
                return Ok(String::new());
            }
            if let Some(s) = content.as_str() {
                return Ok(s.to_string());
            }
        }
    }

    if let Some(parts) = value.as_array() {
        let mut out = String::new();
        for part in parts {
            let piece = part
                .as_str()
                .map(str::to_string)
                .or_else(|| {
                    part.get("markdown")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .or_else(|| part.get("text").and_then(|v| v.as_str()).map(str::to_string))
                .ok_or_else(|| {
                    PipelineError::ExternalPermanent(
                        "unrecognized part in parser list response".into(),
                    )
                })?;
            if !out.is_empty() && !piece.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&piece);
        }
        return Ok(out);
    }

    Err(PipelineError::ExternalPermanent(format!(
        "unrecognized parser response shape: {}",
        shape_of(value)
    )))
}

fn decode_assets(json: &serde_json::Value) -> StageResult<Vec<ParsedAsset>> {
    let Some(raw) = json.get("assets").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };

    let mut assets = Vec::with_capacity(raw.len());
    for item in raw {
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::ExternalPermanent("asset missing id".into()))?
            .to_string();

        let kind = match item.get("kind").and_then(|v| v.as_str()) {
            Some("image") => AssetKind::Image,
            Some("table") => AssetKind::Table,
            other => {
                return Err(PipelineError::ExternalPermanent(format!(
                    "asset {} has unknown kind {:?}",
                    id, other
                )))
            }
        };

        let data = item
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::ExternalPermanent(format!("asset {} missing data", id)))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| {
                PipelineError::ExternalPermanent(format!("asset {} bad base64: {}", id, e))
            })?;

        let page = item.get("page").and_then(|v| v.as_i64()).map(|p| p as i32);
        let bbox = item.get("bbox").and_then(|v| v.as_array()).and_then(|arr| {
            if arr.len() == 4 {
                let mut out = [0f64; 4];
                for (i, v) in arr.iter().enumerate() {
                    out[i] = v.as_f64()?;
                }
                Some(out)
            } else {
                None
            }
        });

        assets.push(ParsedAsset {
            id,
            kind,
            page,
            bbox,
            bytes,
        });
    }

    Ok(assets)
}

fn shape_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Minimal HTML → markdown fallback. Enough structure survives (headers,
/// paragraphs, list items, line breaks) for downstream preprocessing to
/// retag headers; everything else is stripped to text.
pub fn html_to_markdown(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = rest[open + 1..open + close].trim().to_ascii_lowercase();
        let name = tag
            .trim_start_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or("");

        match name {
            "h1" if !tag.starts_with('/') => out.push_str("\n# "),
            "h2" if !tag.starts_with('/') => out.push_str("\n## "),
            "h3" | "h4" | "h5" | "h6" if !tag.starts_with('/') => out.push_str("\n### "),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => out.push('\n'),
            "p" | "div" | "tr" => out.push('\n'),
            "br" => out.push('\n'),
            "li" if !tag.starts_with('/') => out.push_str("\n- "),
            "td" | "th" if tag.starts_with('/') => out.push(' '),
            _ => {}
        }

        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");

    // Collapse runs of blank lines left behind by block tags.
    let mut cleaned = String::with_capacity(decoded.len());
    let mut blank_run = 0;
    for line in decoded.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(trimmed);
        cleaned.push('\n');
    }
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_raw_string() {
        let json = serde_json::json!("# 제목\n본문");
        let doc = decode_response(&json).unwrap();
        assert_eq!(doc.markdown, "# 제목\n본문");
        assert!(doc.assets.is_empty());
    }

    #[test]
    fn accepts_markdown_dict() {
        let json = serde_json::json!({ "markdown": "## 논의안건 1. 축제 예산" });
        let doc = decode_response(&json).unwrap();
        assert_eq!(doc.markdown, "## 논의안건 1. 축제 예산");
    }

    #[test]
    fn accepts_text_dict() {
        let json = serde_json::json!({ "text": "plain body" });
        assert_eq!(decode_response(&json).unwrap().markdown, "plain body");
    }

    #[test]
    fn accepts_nested_content() {
        let json = serde_json::json!({ "content": { "markdown": "nested" } });
        assert_eq!(decode_response(&json).unwrap().markdown, "nested");
    }

    #[test]
    fn accepts_list_of_parts() {
        let json = serde_json::json!([{ "markdown": "part one" }, { "text": "part two" }]);
        let doc = decode_response(&json).unwrap();
        assert_eq!(doc.markdown, "part one\n\npart two");
    }

    #[test]
    fn rejects_unknown_shape() {
        let json = serde_json::json!(42);
        assert!(matches!(
            decode_response(&json),
            Err(PipelineError::ExternalPermanent(_))
        ));
    }

    #[test]
    fn rejects_unknown_part() {
        let json = serde_json::json!([{ "blob": true }]);
        assert!(decode_response(&json).is_err());
    }

    #[test]
    fn empty_markdown_falls_back_to_html() {
        let json = serde_json::json!({
            "markdown": "",
            "html": "<h2>논의안건 1. 축제 예산</h2><p>본문입니다</p>"
        });
        let doc = decode_response(&json).unwrap();
        assert!(doc.markdown.contains("## 논의안건 1. 축제 예산"));
        assert!(doc.markdown.contains("본문입니다"));
    }

    #[test]
    fn decodes_assets() {
        let png = base64::engine::general_purpose::STANDARD.encode(b"fakepng");
        let json = serde_json::json!({
            "markdown": "body ![](asset://img1)",
            "assets": [{ "id": "img1", "kind": "image", "page": 2, "bbox": [0.0, 0.0, 1.0, 1.0], "data": png }]
        });
        let doc = decode_response(&json).unwrap();
        assert_eq!(doc.assets.len(), 1);
        assert_eq!(doc.assets[0].kind, AssetKind::Image);
        assert_eq!(doc.assets[0].page, Some(2));
        assert_eq!(doc.assets[0].bytes, b"fakepng");
    }

    #[test]
    fn rejects_bad_asset_kind() {
        let json = serde_json::json!({
            "markdown": "x",
            "assets": [{ "id": "a", "kind": "chart", "data": "" }]
        });
        assert!(decode_response(&json).is_err());
    }

    #[test]
    fn html_tables_become_rows() {
        let md = html_to_markdown("<table><tr><td>a</td><td>b</td></tr><tr><td>c</td></tr></table>");
        assert!(md.contains("a b"));
        assert!(md.contains('c'));
    }
}
