use crate::{
    db::{handlers::Jobs, models::jobs::JobCreateDBRequest},
    errors::{Error, Result},
    jobs::{JobStore, TerminalUpdate, TransformationJob},
    types::{ExternalTaskId, JobId, ProjectId, ReservationId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{pool::PoolConnection, PgPool, Postgres};

/// [`JobStore`] backed by the `images` table.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(|e| Error::Database(e.into()))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, request: &JobCreateDBRequest) -> Result<TransformationJob> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).create(request).await?)
    }

    async fn get(&self, id: JobId) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).get_by_id(id).await?)
    }

    async fn find_by_external_task(&self, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).get_by_external_task(task_id).await?)
    }

    async fn list_for_user(&self, user_id: UserId, project_id: Option<ProjectId>, skip: i64, limit: i64) -> Result<Vec<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).list_for_user(user_id, project_id, skip, limit).await?)
    }

    async fn start_processing(&self, id: JobId, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).start_processing(id, reservation_id, now).await?)
    }

    async fn attach_external_task(&self, id: JobId, task_id: &ExternalTaskId) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).attach_external_task(id, task_id).await?)
    }

    async fn finish(&self, id: JobId, update: &TerminalUpdate, now: DateTime<Utc>) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).finish(id, update, now).await?)
    }

    async fn reset_for_regeneration(&self, id: JobId) -> Result<Option<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).reset_for_regeneration(id).await?)
    }

    async fn list_processing_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TransformationJob>> {
        let mut conn = self.conn().await?;
        Ok(Jobs::new(&mut conn).list_processing_started_before(cutoff).await?)
    }
}
