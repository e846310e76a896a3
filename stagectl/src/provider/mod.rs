//! The external AI image-generation provider.
//!
//! A provider either answers a submit with the finished image or accepts the
//! work and hands back a task id, whose outcome arrives later through polling
//! or a webhook. Both deliveries carry a [`TaskReport`].

pub mod http;

use crate::{errors::Error, types::ExternalTaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

pub use http::HttpProvider;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub source_url: String,
    /// Opaque style parameters, passed through untouched
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The provider answered synchronously
    Completed { result_url: String },
    /// The provider queued the work
    Accepted { task_id: ExternalTaskId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Status of a provider task, from a poll or a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskReport {
    #[schema(value_type = String)]
    pub task_id: ExternalTaskId,
    pub status: TaskState,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to provider failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider rejected the generation: {0}")]
    Rejected(String),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        Error::ExternalProvider { message: err.to_string() }
    }
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitOutcome, ProviderError>;

    async fn poll_status(&self, task_id: &ExternalTaskId) -> Result<TaskReport, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_body_parses_without_optional_fields() {
        let report: TaskReport = serde_json::from_str(r#"{"task_id": "t-1", "status": "processing"}"#).unwrap();
        assert_eq!(report.task_id, ExternalTaskId::from("t-1"));
        assert_eq!(report.status, TaskState::Processing);
        assert!(!report.status.is_terminal());
        assert!(report.result_url.is_none());
    }

    #[test]
    fn test_provider_error_maps_to_external_provider() {
        let err: Error = ProviderError::Rejected("nsfw".into()).into();
        assert!(matches!(err, Error::ExternalProvider { ref message } if message.contains("nsfw")));
    }
}
