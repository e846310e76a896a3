use crate::{
    api::models::jobs::{JobCreate, JobResponse, ListJobsQuery},
    auth::CurrentUser,
    errors::{Error, Result},
    jobs::{JobStatus, TransformationJob},
    types::JobId,
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

/// Load a job the caller may act on. Other users' jobs read as missing.
async fn load_owned(state: &AppState, current_user: &CurrentUser, job_id: JobId) -> Result<TransformationJob> {
    let job = state.orchestrator.get_job(job_id).await?;
    if !current_user.can_access(job.user_id) {
        return Err(Error::not_found("Job", job_id));
    }
    Ok(job)
}

/// 202 while the provider is still working, 200 once the job settled
async fn respond(state: &AppState, job: TransformationJob) -> (StatusCode, Json<JobResponse>) {
    if let Some(poller) = &state.poller {
        poller.track(&job).await;
    }
    let status = if job.status == JobStatus::Processing {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(JobResponse::from(job)))
}

/// Register an uploaded photo as a transformation job
#[utoipa::path(
    post,
    path = "/jobs",
    tag = "jobs",
    summary = "Create a job",
    request_body = JobCreate,
    responses(
        (status = 201, description = "Job created in pending state", body = JobResponse),
        (status = 400, description = "Invalid original_url"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn create_job(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(data): Json<JobCreate>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let params = if data.generation_params.is_null() {
        serde_json::json!({})
    } else {
        data.generation_params
    };
    let job = state
        .orchestrator
        .create_job(current_user.id, data.project_id, &data.original_url, params)
        .await?;
    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    summary = "List your jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs, newest first", body = [JobResponse]),
        (status = 401, description = "Unauthorized"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
    current_user: CurrentUser,
) -> Result<Json<Vec<JobResponse>>> {
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);

    let jobs = state
        .orchestrator
        .list_jobs(current_user.id, query.project_id, skip, limit)
        .await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    tag = "jobs",
    summary = "Get a job",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Job not found"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<Json<JobResponse>> {
    let job = load_owned(&state, &current_user, job_id).await?;
    Ok(Json(JobResponse::from(job)))
}

/// Spend credits to generate the staged image
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/generate",
    tag = "jobs",
    summary = "Generate",
    description = "Reserves credits and submits the job to the provider. The reservation is billed only once a result is stored.",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Generated synchronously", body = JobResponse),
        (status = 202, description = "Accepted by the provider; poll or wait for the webhook", body = JobResponse),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not pending"),
        (status = 502, description = "Provider or storage failure; job failed and credits released"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn generate(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<(StatusCode, Json<JobResponse>)> {
    load_owned(&state, &current_user, job_id).await?;
    let job = state.orchestrator.generate(job_id).await?;
    Ok(respond(&state, job).await)
}

#[utoipa::path(
    post,
    path = "/jobs/{job_id}/regenerate",
    tag = "jobs",
    summary = "Regenerate",
    description = "Starts a new attempt for a completed or failed job. The new attempt is billed separately.",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Generated synchronously", body = JobResponse),
        (status = 202, description = "Accepted by the provider", body = JobResponse),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not completed or failed"),
        (status = 502, description = "Provider or storage failure"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn regenerate(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<(StatusCode, Json<JobResponse>)> {
    load_owned(&state, &current_user, job_id).await?;
    let job = state.orchestrator.regenerate(job_id).await?;
    Ok(respond(&state, job).await)
}

/// Ask the provider for the current status of a processing job
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/status",
    tag = "jobs",
    summary = "Refresh status",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job has settled", body = JobResponse),
        (status = 202, description = "Still processing", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 502, description = "Provider could not be reached"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn refresh_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    current_user: CurrentUser,
) -> Result<(StatusCode, Json<JobResponse>)> {
    load_owned(&state, &current_user, job_id).await?;
    let job = state.orchestrator.refresh_status(job_id).await?;
    Ok(respond(&state, job).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{ADMIN_HEADER, USER_HEADER},
        test_utils::{create_test_app, create_test_config, Harness, MockProvider},
    };
    use serde_json::json;
    use uuid::Uuid;

    #[test_log::test(tokio::test)]
    async fn test_create_and_generate_job() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 2).await;

        let response = app
            .post("/api/v1/jobs")
            .add_header(USER_HEADER, user.to_string())
            .json(&json!({
                "project_id": Uuid::new_v4(),
                "original_url": "https://uploads.example.com/living-room.jpg",
                "generation_params": {"style": "japandi", "room": "living_room"}
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let job: JobResponse = response.json();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.generation_params["style"], "japandi");

        let response = app
            .post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;
        response.assert_status_ok();
        let job: JobResponse = response.json();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.transformed_url.is_some());
        assert_eq!(h.ledger.get_balance(user).await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_async_returns_accepted() {
        let h = Harness::new(MockProvider::accepting());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 1).await;
        let job = h.pending_job(user).await;

        let response = app
            .post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;

        response.assert_status(StatusCode::ACCEPTED);
        let job: JobResponse = response.json();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.external_task_id.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_without_credits_is_payment_required() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        let job = h.pending_job(user).await;

        let response = app
            .post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;

        response.assert_status(StatusCode::PAYMENT_REQUIRED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "insufficient_credits");
        assert_eq!(body["required"], 1);
        assert_eq!(body["available"], 0);
        assert_eq!(body["missing"], 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_twice_conflicts() {
        let h = Harness::new(MockProvider::accepting());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 5).await;
        let job = h.pending_job(user).await;
        h.orchestrator.generate(job.id).await.unwrap();

        let response = app
            .post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;

        response.assert_status(StatusCode::CONFLICT);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "invalid_job_state");
    }

    #[test_log::test(tokio::test)]
    async fn test_provider_failure_is_bad_gateway() {
        let h = Harness::new(MockProvider::failing("upstream down"));
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 1).await;
        let job = h.pending_job(user).await;

        let response = app
            .post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;

        response.assert_status(StatusCode::BAD_GATEWAY);
        let job = h.orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.ledger.get_balance(user).await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_other_users_jobs_are_hidden() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        let owner = Uuid::new_v4();
        let job = h.pending_job(owner).await;

        let intruder = Uuid::new_v4().to_string();
        app.get(&format!("/api/v1/jobs/{}", job.id))
            .add_header(USER_HEADER, intruder.clone())
            .await
            .assert_status_not_found();
        app.post(&format!("/api/v1/jobs/{}/generate", job.id))
            .add_header(USER_HEADER, intruder.clone())
            .await
            .assert_status_not_found();

        app.get(&format!("/api/v1/jobs/{}", job.id))
            .add_header(USER_HEADER, intruder)
            .add_header(ADMIN_HEADER, "true")
            .await
            .assert_status_ok();
    }

    #[test_log::test(tokio::test)]
    async fn test_list_jobs_filters_by_project() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();
        h.orchestrator
            .create_job(user, project, "https://uploads.example.com/a.jpg", json!({}))
            .await
            .unwrap();
        h.pending_job(user).await;
        h.pending_job(Uuid::new_v4()).await;

        let all: Vec<JobResponse> = app
            .get("/api/v1/jobs")
            .add_header(USER_HEADER, user.to_string())
            .await
            .json();
        assert_eq!(all.len(), 2);

        let filtered: Vec<JobResponse> = app
            .get(&format!("/api/v1/jobs?project_id={project}"))
            .add_header(USER_HEADER, user.to_string())
            .await
            .json();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project_id, project);
    }

    #[test_log::test(tokio::test)]
    async fn test_refresh_status_settles_finished_task() {
        let h = Harness::new(MockProvider::accepting());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 1).await;
        let job = h.pending_job(user).await;
        let job = h.orchestrator.generate(job.id).await.unwrap();

        let response = app
            .post(&format!("/api/v1/jobs/{}/status", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;
        response.assert_status(StatusCode::ACCEPTED);

        h.provider
            .finish_task(job.external_task_id.as_ref().unwrap(), "https://provider.example.com/r.png");
        let response = app
            .post(&format!("/api/v1/jobs/{}/status", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;
        response.assert_status_ok();
        let job: JobResponse = response.json();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.ledger.get_balance(user).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_regenerate_requires_terminal_job() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        let user = Uuid::new_v4();
        h.fund(user, 2).await;
        let job = h.pending_job(user).await;

        app.post(&format!("/api/v1/jobs/{}/regenerate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await
            .assert_status(StatusCode::CONFLICT);

        h.orchestrator.generate(job.id).await.unwrap();
        let response = app
            .post(&format!("/api/v1/jobs/{}/regenerate", job.id))
            .add_header(USER_HEADER, user.to_string())
            .await;
        response.assert_status_ok();
        let job: JobResponse = response.json();
        assert_eq!(job.attempt, 1);
        assert_eq!(h.ledger.get_balance(user).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_identity_is_unauthorized() {
        let h = Harness::new(MockProvider::immediate());
        let app = create_test_app(&h, create_test_config());
        app.get("/api/v1/jobs").await.assert_status_unauthorized();
    }
}
