use crate::{
    jobs::{JobStatus, TransformationJob},
    types::{JobId, ProjectId, ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobCreate {
    #[schema(value_type = String, format = "uuid")]
    pub project_id: ProjectId,
    /// Where the uploaded room photo can be fetched from
    pub original_url: String,
    /// Style parameters forwarded to the provider untouched
    #[serde(default)]
    #[schema(value_type = Object)]
    pub generation_params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: JobId,
    #[schema(value_type = String, format = "uuid")]
    pub project_id: ProjectId,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub original_url: String,
    pub transformed_url: Option<String>,
    pub status: JobStatus,
    pub external_task_id: Option<String>,
    pub error_message: Option<String>,
    #[schema(value_type = Object)]
    pub generation_params: serde_json::Value,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub reservation_id: Option<ReservationId>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// Only jobs belonging to this project
    #[param(value_type = Option<String>, format = "uuid")]
    pub project_id: Option<ProjectId>,

    /// Number of items to skip
    pub skip: Option<i64>,

    /// Maximum number of items to return
    pub limit: Option<i64>,
}

impl From<TransformationJob> for JobResponse {
    fn from(job: TransformationJob) -> Self {
        Self {
            id: job.id,
            project_id: job.project_id,
            user_id: job.user_id,
            original_url: job.original_url,
            transformed_url: job.transformed_url,
            status: job.status,
            external_task_id: job.external_task_id.map(|t| t.0),
            error_message: job.error_message,
            generation_params: job.generation_params,
            reservation_id: job.reservation_id,
            attempt: job.attempt,
            created_at: job.created_at,
            updated_at: job.updated_at,
            processing_started_at: job.processing_started_at,
            completed_at: job.completed_at,
            duration_ms: job.duration_ms,
        }
    }
}
