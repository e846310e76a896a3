use crate::{
    api::models::jobs::JobResponse,
    errors::{Error, Result},
    provider::TaskReport,
    AppState,
};
use axum::{extract::State, http::HeaderMap, response::Json};
use tracing::{info, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Completion callback from the generation provider
#[utoipa::path(
    post,
    path = "/webhooks/generation",
    tag = "webhooks",
    summary = "Provider status callback",
    description = "Applies a task status pushed by the provider. Deliveries for jobs that already settled are acknowledged without effect, so the provider may retry freely.",
    request_body = TaskReport,
    responses(
        (status = 200, description = "Report applied or already settled", body = JobResponse),
        (status = 401, description = "Missing or wrong X-Webhook-Secret"),
        (status = 404, description = "No job is waiting on this task"),
    )
)]
pub async fn generation_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<TaskReport>,
) -> Result<Json<JobResponse>> {
    if let Some(expected) = &state.config.webhook_secret {
        let provided = headers.get(WEBHOOK_SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!(task_id = %report.task_id, "Rejected webhook with bad secret");
            return Err(Error::Unauthorized);
        }
    }

    let job = state.orchestrator.report_webhook(report).await?;
    if job.status.is_terminal() {
        if let Some(poller) = &state.poller {
            poller.stop(job.id).await;
        }
        info!(job_id = %job.id, status = %job.status, "Webhook settled job");
    }
    Ok(Json(JobResponse::from(job)))
}
