//! Blob store: a per-run scratch directory plus an object-storage bucket.
//!
//! Two namespaces with different lifetimes. The scratch directory holds
//! per-run temporary files (drive exports, parser inputs) and is purged when
//! the pipeline run finishes regardless of success. The bucket holds durable
//! originals and extracted images, reached over the S3 REST API with AWS
//! Signature V4 signing in pure Rust (`hmac` + `sha2`), so S3-compatible
//! services (MinIO, LocalStack) work through `endpoint_url`.
//!
//! Guarantees: local writes are atomic at the key level (write-to-temp +
//! rename); remote writes are single-request uploads; deletes are idempotent.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` — required for bucket operations
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials)

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// Handle over both blob namespaces. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    client: reqwest::Client,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    // ============ Scratch namespace ============

    /// Directory for one pipeline run. Created on first use.
    pub fn scratch_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.config.scratch_dir.join(run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create scratch dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Atomic local write: write to a `.tmp` sibling, then rename.
    pub fn scratch_put(&self, run_id: &str, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.scratch_dir(run_id)?;
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Remove a run's scratch files. Idempotent; called on pipeline
    /// completion regardless of success.
    pub fn scratch_purge(&self, run_id: &str) -> Result<()> {
        let dir = self.config.scratch_dir.join(run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    // ============ Bucket namespace ============

    /// Upload bytes under `key`, returning the object's URL.
    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let creds = Credentials::from_env()?;
        let (url, auth, amz_date, payload_hash, token) =
            self.sign("PUT", key, "", &bytes, &creds)?;

        let mut req = self
            .client
            .put(&url)
            .header("Authorization", &auth)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("Content-Type", content_type)
            .body(bytes);
        if let Some(t) = token {
            req = req.header("x-amz-security-token", t);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("PutObject failed (HTTP {}) for '{}': {}", status, key, truncate(&body));
        }

        Ok(self.object_url(key))
    }

    /// Download an object's bytes.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let creds = Credentials::from_env()?;
        let (url, auth, amz_date, payload_hash, token) = self.sign("GET", key, "", &[], &creds)?;

        let mut req = self
            .client
            .get(&url)
            .header("Authorization", &auth)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(t) = token {
            req = req.header("x-amz-security-token", t);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            bail!("GetObject failed (HTTP {}) for '{}'", resp.status(), key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Delete an object. A missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let creds = Credentials::from_env()?;
        let (url, auth, amz_date, payload_hash, token) =
            self.sign("DELETE", key, "", &[], &creds)?;

        let mut req = self
            .client
            .delete(&url)
            .header("Authorization", &auth)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(t) = token {
            req = req.header("x-amz-security-token", t);
        }

        let resp = req.send().await?;
        // 404 counts as success: deletes are idempotent.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            bail!("DeleteObject failed (HTTP {}) for '{}'", resp.status(), key);
        }
        Ok(())
    }

    /// List object keys under a prefix, following pagination.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let creds = Credentials::from_env()?;
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref t) = continuation {
                params.push(("continuation-token".to_string(), t.clone()));
            }
            params.sort_by(|a, b| a.0.cmp(&b.0));
            let query: String = params
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let (url, auth, amz_date, payload_hash, token) =
                self.sign("GET", "", &query, &[], &creds)?;

            let mut req = self
                .client
                .get(&url)
                .header("Authorization", &auth)
                .header("x-amz-content-sha256", &payload_hash)
                .header("x-amz-date", &amz_date);
            if let Some(t) = token {
                req = req.header("x-amz-security-token", t);
            }

            let resp = req.send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("ListObjectsV2 failed (HTTP {}): {}", status, truncate(&body));
            }

            let xml = resp.text().await?;
            let (batch, truncated, next) = parse_list_response(&xml);
            keys.extend(batch);
            if truncated {
                continuation = next;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    /// Public URL of an object, in HTTPS form.
    pub fn object_url(&self, key: &str) -> String {
        let encoded = encode_key(key);
        format!("https://{}/{}", self.host(), encoded)
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.config.bucket, self.config.region)
        }
    }

    /// Produce a signed request: URL, Authorization header, x-amz-date,
    /// payload hash, and optional session token.
    fn sign(
        &self,
        method: &str,
        key: &str,
        query: &str,
        payload: &[u8],
        creds: &Credentials,
    ) -> Result<(String, String, String, String, Option<String>)> {
        let host = self.host();
        let canonical_uri = if key.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", encode_key(key))
        };

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = sha256_hex(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = creds.signing_key(&date_stamp, &self.config.region);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if query.is_empty() {
            format!("https://{}{}", host, canonical_uri)
        } else {
            format!("https://{}{}?{}", host, canonical_uri, query)
        };

        Ok((url, authorization, amz_date, payload_hash, creds.session_token.clone()))
    }
}

// ============ Credentials ============

struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    /// Day-scoped SigV4 signing key: the secret (prefixed `AWS4`) is folded
    /// through the scope components date → region → service → terminator,
    /// each round keying the next HMAC with the previous digest.
    fn signing_key(&self, date_stamp: &str, region: &str) -> Vec<u8> {
        let seed = format!("AWS4{}", self.secret_access_key);
        [date_stamp, region, "s3", "aws4_request"]
            .iter()
            .fold(seed.into_bytes(), |key, part| {
                hmac_sha256(&key, part.as_bytes())
            })
    }
}

// ============ Digest helpers ============

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode for SigV4 canonical requests: RFC 3986 unreserved bytes
/// pass through, everything else becomes `%XX`.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Encode a key path segment by segment, keeping the slashes.
fn encode_key(key: &str) -> String {
    key.split('/').map(percent_encode).collect::<Vec<_>>().join("/")
}

fn truncate(s: &str) -> String {
    s.chars().take(500).collect()
}

// ============ XML parsing (minimal, no extra deps) ============

fn parse_list_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let value_start = start + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials(secret: &str) -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: secret.into(),
            session_token: None,
        }
    }

    #[test]
    fn percent_encode_unreserved_passthrough() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("한글"), "%ED%95%9C%EA%B8%80");
    }

    #[test]
    fn encode_key_keeps_slashes() {
        assert_eq!(encode_key("images/doc 1/a.png"), "images/doc%201/a.png");
    }

    #[test]
    fn signing_key_varies_with_scope() {
        let creds = test_credentials("secret");
        let a = creds.signing_key("20250101", "us-east-1");
        let b = creds.signing_key("20250101", "us-east-1");
        assert_eq!(a, b);
        assert_ne!(a, creds.signing_key("20250102", "us-east-1"));
        assert_ne!(a, creds.signing_key("20250101", "ap-northeast-2"));
        assert_ne!(a, test_credentials("other").signing_key("20250101", "us-east-1"));
    }

    #[test]
    fn parse_list_response_pagination() {
        let xml = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <NextContinuationToken>tok123</NextContinuationToken>
            <Contents><Key>images/a.png</Key></Contents>
            <Contents><Key>images/sub/</Key></Contents>
            <Contents><Key>images/b.png</Key></Contents>
        </ListBucketResult>"#;
        let (keys, truncated, next) = parse_list_response(xml);
        assert_eq!(keys, vec!["images/a.png", "images/b.png"]);
        assert!(truncated);
        assert_eq!(next.as_deref(), Some("tok123"));
    }

    #[test]
    fn scratch_put_then_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(&crate::config::StorageConfig {
            bucket: "test".into(),
            region: "us-east-1".into(),
            endpoint_url: None,
            scratch_dir: tmp.path().to_path_buf(),
        });

        let path = storage.scratch_put("run1", "file.docx", b"bytes").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes");

        storage.scratch_purge("run1").unwrap();
        assert!(!path.exists());
        // Purging again is fine.
        storage.scratch_purge("run1").unwrap();
    }
}
