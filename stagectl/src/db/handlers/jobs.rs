use crate::{
    db::{errors::Result, models::jobs::JobCreateDBRequest},
    jobs::{JobStatus, TerminalUpdate, TransformationJob},
    types::{ExternalTaskId, JobId, ProjectId, ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::trace;

// Database entity model for an image being staged
#[derive(Debug, Clone, FromRow)]
pub struct Image {
    pub id: JobId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub original_url: String,
    pub transformed_url: Option<String>,
    pub status: JobStatus,
    pub external_task_id: Option<String>,
    pub error_message: Option<String>,
    pub generation_params: serde_json::Value,
    pub reservation_id: Option<ReservationId>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<Image> for TransformationJob {
    fn from(image: Image) -> Self {
        Self {
            id: image.id,
            project_id: image.project_id,
            user_id: image.user_id,
            original_url: image.original_url,
            transformed_url: image.transformed_url,
            status: image.status,
            external_task_id: image.external_task_id.map(ExternalTaskId),
            error_message: image.error_message,
            generation_params: image.generation_params,
            reservation_id: image.reservation_id,
            attempt: image.attempt,
            created_at: image.created_at,
            updated_at: image.updated_at,
            processing_started_at: image.processing_started_at,
            completed_at: image.completed_at,
            duration_ms: image.duration_ms,
        }
    }
}

const IMAGE_COLUMNS: &str = "id, project_id, user_id, original_url, transformed_url, status, external_task_id, error_message, \
     generation_params, reservation_id, attempt, created_at, updated_at, processing_started_at, completed_at, duration_ms";

pub struct Jobs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Jobs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    pub async fn create(&mut self, request: &JobCreateDBRequest) -> Result<TransformationJob> {
        let query = format!(
            r#"
            INSERT INTO images (project_id, user_id, original_url, generation_params, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING {IMAGE_COLUMNS}
            "#
        );
        let image = sqlx::query_as::<_, Image>(&query)
            .bind(request.project_id)
            .bind(request.user_id)
            .bind(&request.original_url)
            .bind(&request.generation_params)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(image.into())
    }

    pub async fn get_by_id(&mut self, id: JobId) -> Result<Option<TransformationJob>> {
        let query = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1");
        let image = sqlx::query_as::<_, Image>(&query).bind(id).fetch_optional(&mut *self.db).await?;
        Ok(image.map(Into::into))
    }

    pub async fn get_by_external_task(&mut self, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let query = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE external_task_id = $1");
        let image = sqlx::query_as::<_, Image>(&query)
            .bind(task_id.as_str())
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(image.map(Into::into))
    }

    pub async fn list_for_user(&mut self, user_id: UserId, project_id: Option<ProjectId>, skip: i64, limit: i64) -> Result<Vec<TransformationJob>> {
        let query = format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM images
            WHERE user_id = $1 AND ($2::UUID IS NULL OR project_id = $2)
            ORDER BY created_at DESC, id DESC
            OFFSET $3
            LIMIT $4
            "#
        );
        let images = sqlx::query_as::<_, Image>(&query)
            .bind(user_id)
            .bind(project_id)
            .bind(skip)
            .bind(limit)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(images.into_iter().map(Into::into).collect())
    }

    /// `pending -> processing`. `None` when the job was not pending.
    pub async fn start_processing(&mut self, id: JobId, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let query = format!(
            r#"
            UPDATE images
            SET status = 'processing', reservation_id = $2, processing_started_at = $3,
                error_message = NULL, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING {IMAGE_COLUMNS}
            "#
        );
        let image = sqlx::query_as::<_, Image>(&query)
            .bind(id)
            .bind(reservation_id)
            .bind(now)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(image.map(Into::into))
    }

    pub async fn attach_external_task(&mut self, id: JobId, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let query = format!(
            r#"
            UPDATE images
            SET external_task_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {IMAGE_COLUMNS}
            "#
        );
        let image = sqlx::query_as::<_, Image>(&query)
            .bind(id)
            .bind(task_id.as_str())
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(image.map(Into::into))
    }

    /// Leave `processing` for a terminal state. The `status = 'processing'`
    /// guard makes concurrent finishers resolve to exactly one winner.
    pub async fn finish(&mut self, id: JobId, update: &TerminalUpdate, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let (transformed_url, error_message) = match update {
            TerminalUpdate::Completed { transformed_url } => (Some(transformed_url.as_str()), None),
            TerminalUpdate::Failed { error_message } => (None, Some(error_message.as_str())),
        };
        let query = format!(
            r#"
            UPDATE images
            SET status = $2,
                transformed_url = $3,
                error_message = $4,
                completed_at = $5,
                duration_ms = (EXTRACT(EPOCH FROM ($5 - processing_started_at)) * 1000)::BIGINT,
                updated_at = $5
            WHERE id = $1 AND status = 'processing'
            RETURNING {IMAGE_COLUMNS}
            "#
        );
        let image = sqlx::query_as::<_, Image>(&query)
            .bind(id)
            .bind(update.status())
            .bind(transformed_url)
            .bind(error_message)
            .bind(now)
            .fetch_optional(&mut *self.db)
            .await?;
        if image.is_none() {
            trace!("Job {} was no longer processing, {} update dropped", id, update.status());
        }
        Ok(image.map(Into::into))
    }

    pub async fn reset_for_regeneration(&mut self, id: JobId) -> Result<Option<TransformationJob>> {
        let query = format!(
            r#"
            UPDATE images
            SET status = 'pending',
                transformed_url = NULL,
                external_task_id = NULL,
                error_message = NULL,
                reservation_id = NULL,
                processing_started_at = NULL,
                completed_at = NULL,
                duration_ms = NULL,
                attempt = attempt + 1,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('completed', 'failed')
            RETURNING {IMAGE_COLUMNS}
            "#
        );
        let image = sqlx::query_as::<_, Image>(&query).bind(id).fetch_optional(&mut *self.db).await?;
        Ok(image.map(Into::into))
    }

    pub async fn list_processing_started_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<TransformationJob>> {
        let query = format!(
            r#"
            SELECT {IMAGE_COLUMNS}
            FROM images
            WHERE status = 'processing' AND processing_started_at < $1
            ORDER BY processing_started_at
            "#
        );
        let images = sqlx::query_as::<_, Image>(&query).bind(cutoff).fetch_all(&mut *self.db).await?;
        Ok(images.into_iter().map(Into::into).collect())
    }
}
