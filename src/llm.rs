//! Vision + text LLM adapter.
//!
//! One chat-completion client behind six narrow operations: image
//! captioning, file classification, section summarization, query rewriting,
//! answer generation, and event inference. Every call passes through the
//! process-wide token bucket and has a soft fallback: when the upstream
//! refuses or returns something unparsable, the typed result degrades to a
//! structured "unknown" instead of failing the stage. Transport errors (
//! timeouts, 429, 5xx) still surface as temporary failures so the
//! orchestrator can retry.
//!
//! # Authentication
//!
//! A bearer token is read from the `LLM_API_KEY` environment variable.

use base64::Engine;
use chrono::NaiveDate;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{classify_status, PipelineError, StageResult};
use crate::ratelimit::TokenBucket;

/// Raw classification signal. Field values are validated against the closed
/// enums by the classify stage; nothing here is stored directly.
#[derive(Debug, Clone, Default)]
pub struct ClassifySignal {
    pub category: Option<String>,
    pub meeting_subtype: Option<String>,
    pub standardized_name: Option<String>,
}

/// Summary of one agenda-item section.
#[derive(Debug, Clone, Default)]
pub struct SectionSummary {
    pub summary: String,
    pub has_decision: bool,
    pub action_items: Vec<String>,
}

/// Event signal inferred from a parent chunk's text.
#[derive(Debug, Clone, Default)]
pub struct InferredEvent {
    pub event_title: String,
    pub year: Option<i32>,
    pub department: Option<String>,
    pub date: Option<NaiveDate>,
}

/// What kind of caption to request for an extracted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionHint {
    /// The image looks tabular; ask for a markdown table.
    Table,
    /// Pictorial content; ask for a descriptive paragraph.
    Pictorial,
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    bucket: TokenBucket,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> StageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ExternalPermanent(e.to_string()))?;
        Ok(Self {
            client,
            bucket: TokenBucket::new(config.rate_limit_per_sec, 1.0),
            config: config.clone(),
        })
    }

    /// Caption an extracted image. Falls back to a fixed marker so the parse
    /// stage can keep going when captioning refuses.
    pub async fn caption(&self, image_bytes: &[u8], hint: CaptionHint) -> StageResult<String> {
        let instruction = match hint {
            CaptionHint::Table => {
                "이 이미지는 표입니다. 내용을 마크다운 표로 정확히 옮겨 적으세요."
            }
            CaptionHint::Pictorial => {
                "이 이미지를 검색에 쓸 수 있도록 한 단락으로 상세히 설명하세요."
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let content = serde_json::json!([
            { "type": "text", "text": instruction },
            { "type": "image", "data": encoded },
        ]);

        let reply = self
            .chat(&[message_value("user", content)])
            .await?
            .trim()
            .to_string();
        if reply.is_empty() {
            return Ok("(이미지 내용을 확인할 수 없음)".to_string());
        }
        Ok(reply)
    }

    /// Classify a file by name and containing-folder path. Second-pass only;
    /// the regex taxonomy runs first.
    pub async fn classify(&self, file_name: &str, path: &str) -> StageResult<ClassifySignal> {
        let prompt = format!(
            "다음 파일을 분류하세요.\n파일명: {}\n경로: {}\n\
             JSON으로만 답하세요: {{\"category\": \"meeting_document|work_document|other_document\", \
             \"meeting_subtype\": \"agenda|minutes|result|null\", \
             \"standardized_name\": \"정리된 문서명\"}}",
            file_name, path
        );

        let reply = self.chat(&[message_text("user", &prompt)]).await?;
        let Some(json) = extract_first_json_object(&reply) else {
            tracing::warn!(file_name, "classify reply had no JSON object, using fallback");
            return Ok(ClassifySignal::default());
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return Ok(ClassifySignal::default());
        };

        Ok(ClassifySignal {
            category: string_field(&value, "category"),
            meeting_subtype: string_field(&value, "meeting_subtype"),
            standardized_name: string_field(&value, "standardized_name"),
        })
    }

    /// Summarize one agenda-item section for event aggregates.
    pub async fn summarize_section(
        &self,
        section_text: &str,
        kind: &str,
    ) -> StageResult<SectionSummary> {
        let prompt = format!(
            "다음은 회의 문서({})의 한 안건 섹션입니다. 요약하세요.\n\n{}\n\n\
             JSON으로만 답하세요: {{\"summary\": \"...\", \"has_decision\": true/false, \
             \"action_items\": [\"...\"]}}",
            kind, section_text
        );

        let reply = self.chat(&[message_text("user", &prompt)]).await?;
        let Some(json) = extract_first_json_object(&reply) else {
            return Ok(SectionSummary::default());
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return Ok(SectionSummary::default());
        };

        Ok(SectionSummary {
            summary: string_field(&value, "summary").unwrap_or_default(),
            has_decision: value
                .get("has_decision")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            action_items: value
                .get("action_items")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Merge recent turns into a self-contained query. `None` means the
    /// caller should use the raw query.
    pub async fn rewrite_query(
        &self,
        history: &[(String, String)],
        new_query: &str,
    ) -> StageResult<Option<String>> {
        if history.is_empty() {
            return Ok(None);
        }

        let mut transcript = String::new();
        for (role, text) in history {
            transcript.push_str(role);
            transcript.push_str(": ");
            transcript.push_str(text);
            transcript.push('\n');
        }

        let prompt = format!(
            "이전 대화:\n{}\n새 질문: {}\n\n\
             새 질문을 대명사 없이 그 자체로 완결된 한 문장의 검색 질의로 다시 쓰세요. \
             질의 문장만 출력하세요.",
            transcript, new_query
        );

        let reply = self.chat(&[message_text("user", &prompt)]).await?;
        let rewritten = reply.trim().trim_matches('"').to_string();
        if rewritten.is_empty() {
            return Ok(None);
        }
        Ok(Some(rewritten))
    }

    /// Generate an answer grounded in retrieved context. `None` on refusal;
    /// the chat layer then returns sources without an answer.
    pub async fn generate_answer(
        &self,
        query: &str,
        context_chunks: &[String],
    ) -> StageResult<Option<String>> {
        let mut context = String::new();
        for (i, chunk) in context_chunks.iter().enumerate() {
            context.push_str(&format!("[자료 {}]\n{}\n\n", i + 1, chunk));
        }

        let system = "주어진 자료만 근거로 답하세요. 자료에 없으면 모른다고 답하세요.";
        let prompt = format!("자료:\n{}\n질문: {}", context, query);

        let reply = self
            .chat(&[message_text("system", system), message_text("user", &prompt)])
            .await?;
        let answer = reply.trim().to_string();
        if answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(answer))
    }

    /// Restructure header-less text into the agenda markdown hierarchy.
    /// `None` when the model returns nothing usable; the preprocess stage
    /// then keeps the flat text.
    pub async fn restructure_markdown(&self, text: &str) -> StageResult<Option<String>> {
        let prompt = format!(
            "다음 회의 문서 텍스트를 마크다운으로 재구성하세요. 규칙:\n\
             - 안건 분류(보고/논의/의결/기타 안건)는 `# ` 헤더\n\
             - 개별 안건은 `## 논의안건 N. 제목` 형식의 헤더\n\
             - 본문 내용은 바꾸지 말 것\n\n{}",
            text
        );

        let reply = self.chat(&[message_text("user", &prompt)]).await?;
        let restructured = reply.trim();
        if restructured.is_empty() {
            return Ok(None);
        }
        Ok(Some(restructured.to_string()))
    }

    /// Infer which event a parent chunk belongs to.
    pub async fn infer_event(&self, chunk_text: &str) -> StageResult<InferredEvent> {
        let prompt = format!(
            "다음 텍스트가 어떤 행사(축제, 회의 등)에 관한 것인지 추론하세요.\n\n{}\n\n\
             JSON으로만 답하세요: {{\"event_title\": \"...\", \"year\": 2025, \
             \"department\": \"...\", \"date\": \"YYYY-MM-DD\"}}\n\
             알 수 없는 필드는 null로 두세요.",
            chunk_text
        );

        let reply = self.chat(&[message_text("user", &prompt)]).await?;
        let Some(json) = extract_first_json_object(&reply) else {
            return Ok(InferredEvent::default());
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return Ok(InferredEvent::default());
        };

        Ok(InferredEvent {
            event_title: string_field(&value, "event_title").unwrap_or_default(),
            year: value.get("year").and_then(|v| v.as_i64()).map(|y| y as i32),
            department: string_field(&value, "department"),
            date: string_field(&value, "date")
                .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        })
    }

    /// One rate-limited chat completion with retry/backoff.
    async fn chat(&self, messages: &[serde_json::Value]) -> StageResult<String> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| PipelineError::ExternalPermanent("LLM_API_KEY not set".into()))?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model_name,
            "messages": messages,
            "temperature": 0.0,
        });

        let mut last_err: Option<PipelineError> = None;

        for attempt in 0..3u32 {
            if attempt > 0 {
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(60));
                tokio::time::sleep(delay).await;
            }

            self.bucket.acquire().await;

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            PipelineError::ExternalPermanent(format!("llm body: {}", e))
                        })?;
                        return extract_completion(&json);
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
            .unwrap_or_else(|| PipelineError::ExternalTemporary("llm retries exhausted".into())))
    }
}

fn message_text(role: &str, content: &str) -> serde_json::Value {
    serde_json::json!({ "role": role, "content": content })
}

fn message_value(role: &str, content: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "role": role, "content": content })
}

fn extract_completion(json: &serde_json::Value) -> StageResult<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::ExternalPermanent("llm response missing content".into()))
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "null")
        .map(str::to_string)
}

/// Extract the first balanced JSON object from possibly noisy LLM output.
/// Handles nested braces and braces inside JSON strings (with escapes).
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    let mut start: Option<usize> = None;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if start.is_none() {
            if ch == '{' {
                start = Some(i);
                depth = 1;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start?..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_noisy_reply() {
        let reply = "물론입니다! 결과는 다음과 같습니다:\n{\"category\": \"meeting_document\"}\n끝.";
        assert_eq!(
            extract_first_json_object(reply),
            Some("{\"category\": \"meeting_document\"}")
        );
    }

    #[test]
    fn extract_json_handles_nesting_and_strings() {
        let reply = r#"{"a": {"b": "close} brace in string"}, "c": 1} trailing"#;
        let json = extract_first_json_object(reply).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[test]
    fn extract_json_none_without_object() {
        assert!(extract_first_json_object("no json here").is_none());
        assert!(extract_first_json_object("{unclosed").is_none());
    }

    #[test]
    fn completion_extraction() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "답변" } }]
        });
        assert_eq!(extract_completion(&json).unwrap(), "답변");

        let bad = serde_json::json!({ "choices": [] });
        assert!(extract_completion(&bad).is_err());
    }

    #[test]
    fn string_field_filters_null_and_empty() {
        let v = serde_json::json!({ "a": "x", "b": "", "c": "null", "d": 3 });
        assert_eq!(string_field(&v, "a").as_deref(), Some("x"));
        assert!(string_field(&v, "b").is_none());
        assert!(string_field(&v, "c").is_none());
        assert!(string_field(&v, "d").is_none());
        assert!(string_field(&v, "missing").is_none());
    }
}
