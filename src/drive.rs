//! Drive sync adapter.
//!
//! Mirrors a remote drive folder into the per-run scratch directory. Native
//! cloud-document formats are exported to portable formats per the configured
//! MIME map (word-processor → docx, spreadsheet → xlsx, slides → pptx);
//! plain binaries are downloaded as-is. Files whose export type is on the
//! ignore list (online forms) are returned with `skipped = true` so Stage 1
//! can record them as link-only references instead of documents.
//!
//! # Authentication
//!
//! A bearer token is read from the `DRIVE_API_TOKEN` environment variable.
//!
//! # Retry Strategy
//!
//! Transient failures (network, 429, 5xx) retry with bounded exponential
//! backoff: base 1s, doubling, capped at 60s, 3 attempts.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::time::Duration;

use crate::config::DriveConfig;
use crate::error::{classify_status, PipelineError, StageResult};
use crate::models::DriveFile;
use crate::storage::Storage;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct DriveClient {
    config: DriveConfig,
    client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct ListPage {
    files: Vec<RemoteFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RemoteFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    web_view_link: Option<String>,
}

impl DriveClient {
    pub fn new(config: &DriveConfig) -> StageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ExternalPermanent(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// Mirror `folder_id` into the scratch directory for `run_id`.
    ///
    /// Returns one [`DriveFile`] per accepted or skipped file. Files matching
    /// an exclude pattern are dropped entirely; files whose export type is
    /// ignored come back with `skipped = true` and no local path.
    pub async fn sync(
        &self,
        folder_id: &str,
        storage: &Storage,
        run_id: &str,
    ) -> StageResult<Vec<DriveFile>> {
        let include = build_globset(&self.config.include_patterns)?;
        let exclude = build_globset(&self.config.exclude_patterns)?;

        let remote = self.list_folder(folder_id).await?;
        let mut out = Vec::new();

        for file in remote {
            if exclude.is_match(&file.name) || !include.is_match(&file.name) {
                continue;
            }

            if self.config.ignore_export_types.contains(&file.mime_type) {
                out.push(DriveFile {
                    drive_id: file.id,
                    name: file.name,
                    mime_type: file.mime_type,
                    size: file.size,
                    modified_time: file.modified_time,
                    web_link: file.web_view_link,
                    local_path: None,
                    skipped: true,
                });
                continue;
            }

            let (bytes, effective_mime) = self.fetch_content(&file).await?;
            let local_name = format!("{}_{}", file.id, sanitize_name(&file.name));
            let local_path = storage
                .scratch_put(run_id, &local_name, &bytes)
                .map_err(|e| PipelineError::stage("ingest", e.to_string()))?;

            out.push(DriveFile {
                drive_id: file.id,
                name: file.name,
                mime_type: effective_mime,
                size: Some(bytes.len() as i64),
                modified_time: file.modified_time,
                web_link: file.web_view_link,
                local_path: Some(local_path),
                skipped: false,
            });
        }

        tracing::info!(
            remote = %self.config.remote_name,
            folder = folder_id,
            files = out.len(),
            "drive folder mirrored"
        );
        Ok(out)
    }

    async fn list_folder(&self, folder_id: &str) -> StageResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/folders/{}/files",
                self.config.base_url.trim_end_matches('/'),
                folder_id
            );
            if let Some(ref token) = page_token {
                url.push_str(&format!("?page_token={}", token));
            }

            let body = self.get_with_retry(&url).await?;
            let page: ListPage = serde_json::from_slice(&body).map_err(|e| {
                PipelineError::ExternalPermanent(format!("malformed drive listing: {}", e))
            })?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    /// Download or export a file's bytes. Export applies when the MIME map
    /// has an entry for the native type; the returned MIME is then the
    /// export target's.
    async fn fetch_content(&self, file: &RemoteFile) -> StageResult<(Vec<u8>, String)> {
        let base = self.config.base_url.trim_end_matches('/');
        if let Some(export_mime) = self.config.export_formats.get(&file.mime_type) {
            let url = format!(
                "{}/files/{}/export?mime_type={}",
                base,
                file.id,
                urlencode(export_mime)
            );
            let bytes = self.get_with_retry(&url).await?;
            return Ok((bytes, export_mime.clone()));
        }

        let url = format!("{}/files/{}/content", base, file.id);
        let bytes = self.get_with_retry(&url).await?;
        Ok((bytes, file.mime_type.clone()))
    }

    async fn get_with_retry(&self, url: &str) -> StageResult<Vec<u8>> {
        let token = std::env::var("DRIVE_API_TOKEN")
            .map_err(|_| PipelineError::ExternalPermanent("DRIVE_API_TOKEN not set".into()))?;

        let mut last_err: Option<PipelineError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(60));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.bytes().await.map_err(PipelineError::from)?.to_vec());
                    }
                    let body = response.text().await.unwrap_or_default();
                    let err = classify_status(status, &body);
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
            .unwrap_or_else(|| PipelineError::ExternalTemporary("drive retries exhausted".into())))
    }
}

fn build_globset(patterns: &[String]) -> StageResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| PipelineError::InputInvalid(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::InputInvalid(e.to_string()))
}

/// Keep drive file names filesystem-safe without losing the original name
/// recorded on the document row.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

fn urlencode(s: &str) -> String {
    let mut out = String::new();
    for byte in s.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_name("a/b\\c.docx"), "a_b_c.docx");
        assert_eq!(sanitize_name("[안건지] 5차회의.docx"), "[안건지] 5차회의.docx");
    }

    #[test]
    fn urlencode_mime() {
        assert_eq!(
            urlencode("application/vnd.oasis.opendocument.text"),
            "application%2Fvnd.oasis.opendocument.text"
        );
    }

    #[test]
    fn globsets_filter_names() {
        let include = build_globset(&["**/*".to_string()]).unwrap();
        let exclude = build_globset(&["**/~$*".to_string(), "~$*".to_string()]).unwrap();
        assert!(include.is_match("회의록.docx"));
        assert!(exclude.is_match("~$회의록.docx"));
        assert!(!exclude.is_match("회의록.docx"));
    }
}
