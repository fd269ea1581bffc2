//! Error kinds that cross component boundaries.
//!
//! Four kinds flow between stages, the orchestrator, the queue, and the HTTP
//! surface. Stages *return* these values; they never throw across a stage
//! boundary. Internal invariant violations (a parent chunk with a
//! `parent_chunk_id`, a child without one) are bugs and panic the worker
//! task instead of being mapped into this enum.

use thiserror::Error;

/// Error returned by stages and adapters.
///
/// | Variant | Retried | Surfaced as |
/// |---------|---------|-------------|
/// | `InputInvalid` | never | HTTP 4xx |
/// | `ExternalTemporary` | bounded backoff within the stage | `StageFailed` when exhausted |
/// | `ExternalPermanent` | never | `StageFailed` immediately |
/// | `StageFailed` | never | document `failed`, task FAILURE |
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request or data from the caller.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Network timeout, 429, or 5xx from an upstream adapter.
    #[error("temporary upstream failure: {0}")]
    ExternalTemporary(String),

    /// Non-retryable 4xx or a malformed upstream response.
    #[error("permanent upstream failure: {0}")]
    ExternalPermanent(String),

    /// Per-document fatal. Downstream stages do not run.
    #[error("stage {stage} failed: {message}")]
    StageFailed { stage: &'static str, message: String },
}

impl PipelineError {
    /// Whether the orchestrator should retry the stage that returned this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ExternalTemporary(_))
    }

    /// Collapse into the stage-fatal form, preserving the message.
    pub fn into_stage_failure(self, stage: &'static str) -> PipelineError {
        match self {
            PipelineError::StageFailed { .. } => self,
            other => PipelineError::StageFailed {
                stage,
                message: other.to_string(),
            },
        }
    }

    pub fn stage(stage: &'static str, message: impl Into<String>) -> PipelineError {
        PipelineError::StageFailed {
            stage,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::StageFailed {
            stage: "database",
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        // Connection problems and timeouts are transient; everything else
        // reaching here (builder misuse, body decode) is not.
        if e.is_timeout() || e.is_connect() || e.is_request() {
            PipelineError::ExternalTemporary(e.to_string())
        } else {
            PipelineError::ExternalPermanent(e.to_string())
        }
    }
}

/// Classify an upstream HTTP status per the retry policy.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> PipelineError {
    if status.as_u16() == 429 || status.is_server_error() {
        PipelineError::ExternalTemporary(format!("upstream {}: {}", status, body))
    } else {
        PipelineError::ExternalPermanent(format!("upstream {}: {}", status, body))
    }
}

pub type StageResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_temporary_is_retryable() {
        assert!(PipelineError::ExternalTemporary("x".into()).is_retryable());
        assert!(!PipelineError::ExternalPermanent("x".into()).is_retryable());
        assert!(!PipelineError::InputInvalid("x".into()).is_retryable());
        assert!(!PipelineError::stage("parse", "x").is_retryable());
    }

    #[test]
    fn classify_status_retry_split() {
        let too_many = reqwest::StatusCode::TOO_MANY_REQUESTS;
        let bad_gateway = reqwest::StatusCode::BAD_GATEWAY;
        let forbidden = reqwest::StatusCode::FORBIDDEN;
        assert!(classify_status(too_many, "").is_retryable());
        assert!(classify_status(bad_gateway, "").is_retryable());
        assert!(!classify_status(forbidden, "").is_retryable());
    }

    #[test]
    fn stage_failure_keeps_existing_stage() {
        let e = PipelineError::stage("chunk", "empty content");
        let collapsed = e.into_stage_failure("embed");
        match collapsed {
            PipelineError::StageFailed { stage, .. } => assert_eq!(stage, "chunk"),
            _ => panic!("expected StageFailed"),
        }
    }
}
