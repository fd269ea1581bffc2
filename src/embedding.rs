//! Embedding adapter.
//!
//! Calls the embeddings endpoint with batching, retry, and backoff, and
//! provides the vector utilities used by tests and the scoring code. The
//! vector width is the build-time constant [`EMBEDDING_DIM`]; a response of
//! any other width is a permanent upstream failure, never stored.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ... capped at 60s)
//! - other HTTP 4xx → fail immediately
//! - network errors → retry

use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{classify_status, PipelineError, StageResult};
use crate::models::EMBEDDING_DIM;

/// Client for the embeddings endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Embedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> StageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ExternalPermanent(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    /// Adapter-specific maximum batch size.
    pub fn max_batch(&self) -> usize {
        self.config.batch_size
    }

    /// Embed a batch of texts, preserving input order. Batches larger than
    /// [`Self::max_batch`] are split transparently.
    pub async fn embed(&self, texts: &[String]) -> StageResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> StageResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::ExternalPermanent("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> StageResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model_name,
            "input": texts,
        });

        let mut last_err: Option<PipelineError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs((1u64 << (attempt - 1).min(6)).min(60));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            PipelineError::ExternalPermanent(format!(
                                "embedding response body: {}",
                                e
                            ))
                        })?;
                        return parse_embedding_response(&json, texts.len());
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
            .unwrap_or_else(|| PipelineError::ExternalTemporary("embedding retries exhausted".into())))
    }
}

/// Pull `data[].embedding` out of the response and validate count + width.
fn parse_embedding_response(
    json: &serde_json::Value,
    expected_count: usize,
) -> StageResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PipelineError::ExternalPermanent("missing data array".into()))?;

    if data.len() != expected_count {
        return Err(PipelineError::ExternalPermanent(format!(
            "embedding count mismatch: sent {}, got {}",
            expected_count,
            data.len()
        )));
    }

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PipelineError::ExternalPermanent("missing embedding".into()))?;

        if embedding.len() != EMBEDDING_DIM {
            return Err(PipelineError::ExternalPermanent(format!(
                "embedding width {} != {}",
                embedding.len(),
                EMBEDDING_DIM
            )));
        }

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Cosine similarity between two vectors. `0.0` for mismatched or empty
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_response(widths: &[usize]) -> serde_json::Value {
        let data: Vec<serde_json::Value> = widths
            .iter()
            .map(|w| serde_json::json!({ "embedding": vec![0.5f32; *w] }))
            .collect();
        serde_json::json!({ "data": data })
    }

    #[test]
    fn parse_valid_response() {
        let json = fake_response(&[EMBEDDING_DIM, EMBEDDING_DIM]);
        let vecs = parse_embedding_response(&json, 2).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].len(), EMBEDDING_DIM);
    }

    #[test]
    fn reject_wrong_width() {
        let json = fake_response(&[3]);
        assert!(matches!(
            parse_embedding_response(&json, 1),
            Err(PipelineError::ExternalPermanent(_))
        ));
    }

    #[test]
    fn reject_count_mismatch() {
        let json = fake_response(&[EMBEDDING_DIM]);
        assert!(parse_embedding_response(&json, 2).is_err());
    }

    #[test]
    fn reject_missing_data() {
        let json = serde_json::json!({ "unexpected": true });
        assert!(parse_embedding_response(&json, 1).is_err());
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
