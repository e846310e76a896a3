//! Transformation jobs: one uploaded photo and the lifecycle of its generation.
//!
//! ```text
//! pending ──generate──▶ processing ──▶ completed
//!    ▲                       │
//!    │                       └──────▶ failed
//!    └──── regenerate ◀── completed | failed
//! ```
//!
//! Every transition is a conditional write against the current status, so two
//! writers racing on the same job resolve to exactly one winner. The loser
//! observes `None` from the [`JobStore`] and treats it as a no-op.

pub mod postgres;

use crate::{
    db::models::jobs::JobCreateDBRequest,
    errors::Result,
    types::{ExternalTaskId, JobId, ProjectId, ReservationId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

pub use postgres::PostgresJobStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal for the current attempt. Only `regenerate` leaves these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Completed, Pending) | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded room photo and the state of its current generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub original_url: String,
    pub transformed_url: Option<String>,
    pub status: JobStatus,
    pub external_task_id: Option<ExternalTaskId>,
    pub error_message: Option<String>,
    pub generation_params: serde_json::Value,
    /// The single open hold for the current attempt
    pub reservation_id: Option<ReservationId>,
    /// Incremented by each regenerate
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TransformationJob {
    /// Tag recorded on the reservation so the ledger audit trail names the attempt
    pub fn operation_tag(&self) -> String {
        format!("image:{}:attempt:{}", self.id, self.attempt)
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.processing_started_at.map(|started| (now - started).num_milliseconds().max(0))
    }
}

/// Outcome written when a job leaves `processing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalUpdate {
    Completed { transformed_url: String },
    Failed { error_message: String },
}

impl TerminalUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            TerminalUpdate::Completed { .. } => JobStatus::Completed,
            TerminalUpdate::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TerminalUpdate::Failed {
            error_message: message.into(),
        }
    }
}

/// Persistence port for transformation jobs.
///
/// Every mutating method is conditional on the current status and returns
/// `Ok(None)` when the guard did not match.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, request: &JobCreateDBRequest) -> Result<TransformationJob>;

    async fn get(&self, id: JobId) -> Result<Option<TransformationJob>>;

    async fn find_by_external_task(&self, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>>;

    async fn list_for_user(&self, user_id: UserId, project_id: Option<ProjectId>, skip: i64, limit: i64) -> Result<Vec<TransformationJob>>;

    /// `pending -> processing`, recording the reservation that pays for the attempt
    async fn start_processing(&self, id: JobId, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<Option<TransformationJob>>;

    /// Record the provider task id. Only applies while `processing`.
    async fn attach_external_task(&self, id: JobId, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>>;

    /// `processing -> completed | failed`
    async fn finish(&self, id: JobId, update: &TerminalUpdate, now: DateTime<Utc>) -> Result<Option<TransformationJob>>;

    /// `completed | failed -> pending`, clearing the previous attempt's outputs
    async fn reset_for_regeneration(&self, id: JobId) -> Result<Option<TransformationJob>>;

    async fn list_processing_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TransformationJob>>;
}
