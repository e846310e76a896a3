//! Drives transformation jobs through reservation, the provider call and
//! settlement.
//!
//! Completion can arrive three ways: synchronously from submit, from the
//! status poller, or from a provider webhook. The last two both end in
//! [`GenerationOrchestrator::apply_report`], which relies on the job store's
//! guarded transitions so that only the first terminal report settles the
//! reservation.

pub mod sweeper;

use crate::{
    db::models::{
        jobs::JobCreateDBRequest,
        reservations::{SettlementMetadata, SettlementMetadataV1, SettlementOutcome},
    },
    errors::{Error, Result},
    jobs::{JobStatus, JobStore, TerminalUpdate, TransformationJob},
    metrics::GenerationMetrics,
    provider::{AiProvider, GenerationRequest, SubmitOutcome, TaskReport, TaskState},
    reservations::ReservationManager,
    storage::{artifact_key, ArtifactStorage},
    types::{ExternalTaskId, JobId, ProjectId, ReservationId, SettledBy, UserId},
};
use bon::Builder;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

#[derive(Clone, Builder)]
pub struct GenerationOrchestrator {
    jobs: Arc<dyn JobStore>,
    reservations: ReservationManager,
    provider: Arc<dyn AiProvider>,
    storage: Arc<dyn ArtifactStorage>,
    /// Credits held per generation attempt
    #[builder(default = 1)]
    transformation_cost: i64,
    /// Passed to the provider so it can notify us on completion
    webhook_url: Option<Url>,
    metrics: Option<GenerationMetrics>,
}

impl GenerationOrchestrator {
    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    #[instrument(skip(self, generation_params), err)]
    pub async fn create_job(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        original_url: &str,
        generation_params: serde_json::Value,
    ) -> Result<TransformationJob> {
        Url::parse(original_url).map_err(|e| Error::validation(format!("original_url is not a valid URL: {e}")))?;

        let job = self
            .jobs
            .create(&JobCreateDBRequest {
                project_id,
                user_id,
                original_url: original_url.to_string(),
                generation_params,
            })
            .await?;
        info!(job_id = %job.id, "Created transformation job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<TransformationJob> {
        self.jobs.get(job_id).await?.ok_or_else(|| Error::not_found("Job", job_id))
    }

    pub async fn list_jobs(&self, user_id: UserId, project_id: Option<ProjectId>, skip: i64, limit: i64) -> Result<Vec<TransformationJob>> {
        self.jobs.list_for_user(user_id, project_id, skip, limit).await
    }

    /// Start a generation for a pending job.
    ///
    /// Returns the job `completed` when the provider answered synchronously,
    /// or `processing` with an external task id when the result will arrive
    /// later. `InsufficientCredits` leaves the job untouched.
    #[instrument(skip(self), err)]
    pub async fn generate(&self, job_id: JobId) -> Result<TransformationJob> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(Error::InvalidJobState {
                job_id,
                status: job.status,
                action: "generate",
            });
        }

        let reservation = match self.reservations.reserve(job.user_id, self.transformation_cost, job.operation_tag()).await {
            Ok(reservation) => reservation,
            // A concurrent generate already holds credits for this attempt
            Err(Error::ReservationHeld { .. }) => {
                let current = self.get_job(job_id).await?;
                return Err(Error::InvalidJobState {
                    job_id,
                    status: current.status,
                    action: "generate",
                });
            }
            Err(e) => return Err(e),
        };

        let started = match self.jobs.start_processing(job_id, reservation.id, Utc::now()).await {
            Ok(Some(started)) => started,
            Ok(None) => {
                // Someone else moved the job first; this hold must not linger
                self.release(reservation.id, "job was no longer pending").await;
                let current = self.get_job(job_id).await?;
                return Err(Error::InvalidJobState {
                    job_id,
                    status: current.status,
                    action: "generate",
                });
            }
            Err(e) => {
                self.release(reservation.id, "failed to start processing").await;
                return Err(e);
            }
        };

        self.submit(started).await
    }

    /// Reset a finished job for a fresh attempt and generate again.
    ///
    /// The previous attempt's reservation and ledger rows stay as they are;
    /// the new attempt gets its own reservation tagged with the next attempt
    /// number.
    #[instrument(skip(self), err)]
    pub async fn regenerate(&self, job_id: JobId) -> Result<TransformationJob> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(Error::InvalidJobState {
                job_id,
                status: job.status,
                action: "regenerate",
            });
        }

        if self.jobs.reset_for_regeneration(job_id).await?.is_none() {
            let current = self.get_job(job_id).await?;
            return Err(Error::InvalidJobState {
                job_id,
                status: current.status,
                action: "regenerate",
            });
        }
        debug!(%job_id, attempt = job.attempt + 1, "Reset job for regeneration");

        self.generate(job_id).await
    }

    /// Poll the provider for `task_id` and apply the result.
    ///
    /// Provider errors while polling are returned without failing the job:
    /// the task may still finish and be reported by a later check or webhook.
    #[instrument(skip(self), err)]
    pub async fn check_status(&self, job_id: JobId, task_id: &ExternalTaskId, settled_by: SettledBy) -> Result<TransformationJob> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let report = self.provider.poll_status(task_id).await?;
        self.apply_report(job, report, settled_by).await
    }

    /// Manual refresh: poll the provider if the job is waiting on a task,
    /// otherwise return it as is.
    pub async fn refresh_status(&self, job_id: JobId) -> Result<TransformationJob> {
        let job = self.get_job(job_id).await?;
        match (&job.status, &job.external_task_id) {
            (JobStatus::Processing, Some(task_id)) => {
                let task_id = task_id.clone();
                self.check_status(job_id, &task_id, SettledBy::Manual).await
            }
            _ => Ok(job),
        }
    }

    /// Apply a status report pushed for a known job.
    pub async fn report_status(&self, job_id: JobId, report: TaskReport) -> Result<TransformationJob> {
        let job = self.get_job(job_id).await?;
        self.apply_report(job, report, SettledBy::Webhook).await
    }

    /// Apply a webhook delivery, resolving the job by its provider task id.
    #[instrument(skip(self, report), fields(task_id = %report.task_id, status = ?report.status), err)]
    pub async fn report_webhook(&self, report: TaskReport) -> Result<TransformationJob> {
        let job = self
            .jobs
            .find_by_external_task(&report.task_id)
            .await?
            .ok_or_else(|| Error::not_found("Job for task", &report.task_id))?;
        self.apply_report(job, report, SettledBy::Webhook).await
    }

    /// The single consumer of task outcomes. Safe to call any number of
    /// times, concurrently, from any source: non-terminal reports, reports for
    /// a job that already left `processing` and reports for a stale task id
    /// are all no-ops.
    pub async fn apply_report(&self, job: TransformationJob, report: TaskReport, settled_by: SettledBy) -> Result<TransformationJob> {
        if !report.status.is_terminal() {
            debug!(job_id = %job.id, status = ?report.status, "Task still running");
            return Ok(job);
        }
        if job.status != JobStatus::Processing {
            debug!(job_id = %job.id, status = %job.status, %settled_by, "Ignoring report for settled job");
            return Ok(job);
        }
        if job.external_task_id.as_ref() != Some(&report.task_id) {
            warn!(
                job_id = %job.id,
                expected = ?job.external_task_id,
                got = %report.task_id,
                "Ignoring report for a task this job is not waiting on"
            );
            return Ok(job);
        }

        match (report.status, report.result_url) {
            (TaskState::Completed, Some(result_url)) if !result_url.is_empty() => {
                self.complete(job, result_url, settled_by).await
            }
            (TaskState::Completed, _) => {
                self.fail(&job, "provider reported completion without a result url").await
            }
            _ => {
                let message = report.error.unwrap_or_else(|| "generation failed".to_string());
                self.fail(&job, &message).await
            }
        }
    }

    /// Fail a job that is still processing and release its hold. Used for
    /// timeouts; no-op if the job already finished.
    pub async fn time_out(&self, job: &TransformationJob, message: &str) -> Result<TransformationJob> {
        self.fail(job, message).await
    }

    async fn submit(&self, job: TransformationJob) -> Result<TransformationJob> {
        let request = GenerationRequest {
            source_url: job.original_url.clone(),
            params: job.generation_params.clone(),
            webhook_url: self.webhook_url.clone(),
        };

        match self.provider.submit(&request).await {
            Ok(SubmitOutcome::Completed { result_url }) if !result_url.is_empty() => {
                self.complete(job, result_url, SettledBy::Immediate).await
            }
            Ok(SubmitOutcome::Completed { .. }) => {
                let err = Error::ExternalProvider {
                    message: "provider returned an empty result url".to_string(),
                };
                self.fail_after_error(&job, &err).await;
                Err(err)
            }
            Ok(SubmitOutcome::Accepted { task_id }) => match self.jobs.attach_external_task(job.id, &task_id).await {
                Ok(Some(waiting)) => {
                    info!(job_id = %job.id, %task_id, "Generation accepted by provider");
                    Ok(waiting)
                }
                // Already moved on, e.g. timed out by the sweeper
                Ok(None) => self.get_job(job.id).await,
                Err(e) => {
                    self.fail_after_error(&job, &e).await;
                    Err(e)
                }
            },
            Err(e) => {
                let err: Error = e.into();
                self.fail_after_error(&job, &err).await;
                Err(err)
            }
        }
    }

    async fn complete(&self, job: TransformationJob, result_url: String, settled_by: SettledBy) -> Result<TransformationJob> {
        // An expired hold's credits may already back another reservation
        if let Some(reservation_id) = job.reservation_id {
            if !self.reservations.is_live(reservation_id).await? {
                return self.fail(&job, "reservation expired before the result arrived").await;
            }
        }

        let key = artifact_key(job.user_id, job.id, job.attempt);
        let stored_url = match self.storage.persist(&key, &result_url).await {
            Ok(url) => url,
            Err(e) => {
                let err: Error = e.into();
                self.fail_after_error(&job, &err).await;
                return Err(err);
            }
        };

        let update = TerminalUpdate::Completed {
            transformed_url: stored_url.clone(),
        };
        let Some(finished) = self.jobs.finish(job.id, &update, Utc::now()).await? else {
            debug!(job_id = %job.id, %settled_by, "Lost completion race");
            return self.get_job(job.id).await;
        };
        self.record_finished(&finished);
        info!(job_id = %finished.id, %settled_by, duration_ms = ?finished.duration_ms, "Generation completed");

        let Some(reservation_id) = finished.reservation_id else {
            error!(job_id = %finished.id, "Completed job has no reservation to confirm");
            return Ok(finished);
        };
        let metadata = SettlementMetadata::V1(SettlementMetadataV1 {
            job_id: finished.id,
            attempt: finished.attempt,
            external_task_id: finished.external_task_id.clone(),
            result_url: Some(stored_url),
            duration_ms: finished.duration_ms,
            settled_by,
        });
        let outcome = self.reservations.confirm_after_success(reservation_id, &metadata).await?;
        if let SettlementOutcome::AlreadySettled { reservation } = &outcome {
            warn!(
                job_id = %finished.id,
                %reservation_id,
                status = %reservation.status,
                "Completed job's reservation was already settled"
            );
        }
        Ok(finished)
    }

    /// Guarded `processing -> failed` plus cancel. Returns the job as it now is.
    async fn fail(&self, job: &TransformationJob, message: &str) -> Result<TransformationJob> {
        let Some(failed) = self.jobs.finish(job.id, &TerminalUpdate::failed(message), Utc::now()).await? else {
            debug!(job_id = %job.id, "Job already left processing");
            return self.get_job(job.id).await;
        };
        self.record_finished(&failed);
        warn!(job_id = %failed.id, error = message, "Generation failed");

        if let Some(reservation_id) = failed.reservation_id {
            self.reservations.cancel(reservation_id, message).await?;
        }
        Ok(failed)
    }

    /// Fail the job for `err` on the way out of a call that is already
    /// returning `err`.
    async fn fail_after_error(&self, job: &TransformationJob, err: &Error) {
        if let Err(fail_error) = self.fail(job, &err.to_string()).await {
            // Left processing; the sweeper will time it out and release the hold
            error!(job_id = %job.id, error = %fail_error, cause = %err, "Failed to mark job failed");
        }
    }

    async fn release(&self, reservation_id: ReservationId, reason: &str) {
        if let Err(e) = self.reservations.cancel(reservation_id, reason).await {
            error!(%reservation_id, error = %e, "Failed to release reservation");
        }
    }

    fn record_finished(&self, job: &TransformationJob) {
        if let Some(metrics) = &self.metrics {
            metrics.record_job_finished(job.status.as_str(), job.duration_ms);
        }
    }
}
