use crate::{
    config::ProviderConfig,
    provider::{AiProvider, GenerationRequest, ProviderError, SubmitOutcome, TaskReport, TaskState},
    types::ExternalTaskId,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tracing::{debug, instrument};

/// Provider reached over its REST API:
/// `POST {base}/generations` and `GET {base}/generations/{task_id}`.
#[derive(Clone)]
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: Option<String>,
    status: Option<TaskState>,
    result_url: Option<String>,
    error: Option<String>,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ProviderError::InvalidResponse("api key is not a valid header value".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };
        Err(ProviderError::Status { status, body })
    }
}

impl SubmitResponse {
    fn into_outcome(self) -> Result<SubmitOutcome, ProviderError> {
        if self.status == Some(TaskState::Failed) {
            return Err(ProviderError::Rejected(self.error.unwrap_or_else(|| "no reason given".to_string())));
        }
        match (self.result_url, self.task_id) {
            (Some(result_url), _) if !result_url.is_empty() => Ok(SubmitOutcome::Completed { result_url }),
            (_, Some(task_id)) if !task_id.is_empty() => Ok(SubmitOutcome::Accepted {
                task_id: ExternalTaskId(task_id),
            }),
            _ => Err(ProviderError::InvalidResponse(
                "submit response carried neither a result url nor a task id".into(),
            )),
        }
    }
}

#[async_trait]
impl AiProvider for HttpProvider {
    #[instrument(skip(self, request), fields(source_url = %request.source_url), err)]
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitOutcome, ProviderError> {
        let resp = self
            .http
            .post(format!("{}/generations", self.base_url))
            .json(request)
            .send()
            .await?;
        let body: SubmitResponse = Self::ensure_success(resp).await?.json().await?;
        let outcome = body.into_outcome()?;
        debug!(?outcome, "Provider accepted generation");
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn poll_status(&self, task_id: &ExternalTaskId) -> Result<TaskReport, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/generations/{}", self.base_url, task_id))
            .send()
            .await?;
        let report: TaskReport = Self::ensure_success(resp).await?.json().await?;
        if &report.task_id != task_id {
            return Err(ProviderError::InvalidResponse(format!(
                "asked for task {task_id}, got report for {}",
                report.task_id
            )));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::{HeaderMap as AxumHeaders, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use url::Url;

    async fn spawn_provider(router: Router) -> ProviderConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ProviderConfig {
            base_url: Url::parse(&format!("http://{addr}/")).unwrap(),
            api_key: Some("sk-test".into()),
            timeout: Duration::from_secs(5),
            webhook_url: None,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            source_url: "https://uploads.example.com/room.jpg".into(),
            params: json!({"style": "scandinavian"}),
            webhook_url: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_submit_immediate_result() {
        let router = Router::new().route(
            "/generations",
            post(|headers: AxumHeaders, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
                assert_eq!(body["params"]["style"], "scandinavian");
                Json(json!({"status": "completed", "result_url": "https://cdn.example.com/out.png"}))
            }),
        );
        let provider = HttpProvider::new(&spawn_provider(router).await).unwrap();

        let outcome = provider.submit(&request()).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Completed {
                result_url: "https://cdn.example.com/out.png".into()
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_submit_accepted_then_poll() {
        let router = Router::new()
            .route("/generations", post(|| async { Json(json!({"task_id": "task-42", "status": "queued"})) }))
            .route(
                "/generations/{task_id}",
                get(|Path(task_id): Path<String>| async move {
                    Json(json!({"task_id": task_id, "status": "completed", "result_url": "https://cdn.example.com/42.png"}))
                }),
            );
        let provider = HttpProvider::new(&spawn_provider(router).await).unwrap();

        let SubmitOutcome::Accepted { task_id } = provider.submit(&request()).await.unwrap() else {
            panic!("expected an accepted task");
        };
        assert_eq!(task_id.as_str(), "task-42");

        let report = provider.poll_status(&task_id).await.unwrap();
        assert_eq!(report.status, TaskState::Completed);
        assert_eq!(report.result_url.as_deref(), Some("https://cdn.example.com/42.png"));
    }

    #[test_log::test(tokio::test)]
    async fn test_submit_error_status() {
        let router = Router::new().route(
            "/generations",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let provider = HttpProvider::new(&spawn_provider(router).await).unwrap();

        match provider.submit(&request()).await.unwrap_err() {
            ProviderError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_submit_failed_status_is_rejected() {
        let router = Router::new().route(
            "/generations",
            post(|| async { Json(json!({"status": "failed", "error": "unsupported image"})) }),
        );
        let provider = HttpProvider::new(&spawn_provider(router).await).unwrap();

        let err = provider.submit(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(ref reason) if reason == "unsupported image"));
    }

    #[test]
    fn test_empty_submit_response_is_invalid() {
        let response = SubmitResponse {
            task_id: None,
            status: Some(TaskState::Queued),
            result_url: None,
            error: None,
        };
        assert!(matches!(response.into_outcome(), Err(ProviderError::InvalidResponse(_))));
    }
}
