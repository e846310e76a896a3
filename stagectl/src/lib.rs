//! Credit-metered image generation for virtual home staging.
//!
//! Users buy credits, upload room photos as transformation jobs, and spend a
//! credit per generation attempt. Credits are held by a reservation while the
//! AI provider works and are only charged once the result is stored.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod openapi;
pub mod orchestrator;
pub mod polling;
pub mod provider;
pub mod reservations;
pub mod storage;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use crate::{
    config::Config,
    jobs::PostgresJobStore,
    ledger::{cache::CachedLedgerStore, postgres::PostgresLedgerStore, CreditLedger, LedgerStore},
    metrics::GenerationMetrics,
    openapi::ApiDoc,
    orchestrator::{sweeper::Sweeper, GenerationOrchestrator},
    polling::StatusPoller,
    provider::HttpProvider,
    reservations::ReservationManager,
    storage::{ArtifactStorage, HttpArtifactStorage, PassthroughStorage},
};
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub ledger: CreditLedger,
    pub orchestrator: GenerationOrchestrator,
    /// Absent when polling is disabled; webhooks and manual refresh still settle jobs
    pub poller: Option<StatusPoller>,
    pub metrics: Option<GenerationMetrics>,
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors_allowed_origins {
            origins.push(origin.parse::<HeaderValue>()?);
        }
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let api_routes = Router::new()
        .route("/jobs", post(api::handlers::jobs::create_job))
        .route("/jobs", get(api::handlers::jobs::list_jobs))
        .route("/jobs/{job_id}", get(api::handlers::jobs::get_job))
        .route("/jobs/{job_id}/generate", post(api::handlers::jobs::generate))
        .route("/jobs/{job_id}/regenerate", post(api::handlers::jobs::regenerate))
        .route("/jobs/{job_id}/status", post(api::handlers::jobs::refresh_status))
        .route("/credits", get(api::handlers::credits::get_balance))
        .route("/transactions", post(api::handlers::transactions::create_transaction))
        .route("/transactions", get(api::handlers::transactions::list_transactions))
        .route("/transactions/{transaction_id}", get(api::handlers::transactions::get_transaction))
        .with_state(state.clone());

    let webhook_routes = Router::new()
        .route("/webhooks/generation", post(api::handlers::webhooks::generation_callback))
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api/v1", api_routes)
        .merge(webhook_routes)
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/docs"));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors_layer));

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        let generation_metrics = state.metrics.clone();

        // HTTP metrics from axum-prometheus followed by the ledger and job counters
        router = router
            .route(
                "/internal/metrics",
                get(|| async move {
                    let mut body = metric_handle.render();
                    if let Some(metrics) = &generation_metrics {
                        body.push_str(&metrics.render());
                    }
                    body
                }),
            )
            .layer(prometheus_layer);
    }

    Ok(router)
}

/// Wire stores, provider, poller and sweeper, and build the router.
///
/// Background tasks run until the returned guard is dropped.
pub async fn setup_app(pool: PgPool, config: Config) -> anyhow::Result<(Router, DropGuard)> {
    let metrics = if config.enable_metrics {
        Some(GenerationMetrics::new(&prometheus::Registry::new())?)
    } else {
        None
    };

    let ledger_store: Arc<dyn LedgerStore> = Arc::new(CachedLedgerStore::new(
        Arc::new(PostgresLedgerStore::new(pool.clone())),
        config.stats_cache_ttl,
    ));
    let job_store = Arc::new(PostgresJobStore::new(pool));
    let provider = Arc::new(HttpProvider::new(&config.provider)?);
    let storage: Arc<dyn ArtifactStorage> = match &config.storage {
        Some(storage) => Arc::new(HttpArtifactStorage::new(storage)),
        None => {
            warn!("No artifact storage configured, serving provider result URLs directly");
            Arc::new(PassthroughStorage)
        }
    };

    let reservations = ReservationManager::new(ledger_store.clone(), Some(config.reservation_ttl)).with_metrics(metrics.clone());
    let orchestrator = GenerationOrchestrator::builder()
        .jobs(job_store)
        .reservations(reservations)
        .provider(provider)
        .storage(storage)
        .transformation_cost(config.transformation_cost)
        .maybe_webhook_url(config.provider.webhook_url.clone())
        .maybe_metrics(metrics.clone())
        .build();

    let shutdown = CancellationToken::new();

    let poller = if config.polling.enabled {
        let poller = StatusPoller::new(orchestrator.clone(), &config.polling, shutdown.clone());
        poller.resume_in_flight().await?;
        Some(poller)
    } else {
        info!("Status polling disabled");
        None
    };

    if config.sweeper.enabled {
        let sweeper = Sweeper::new(orchestrator.clone(), ledger_store.clone(), config.sweeper.clone());
        tokio::spawn(sweeper.run(shutdown.clone()));
    }

    let state = AppState::builder()
        .config(config)
        .ledger(CreditLedger::new(ledger_store))
        .orchestrator(orchestrator)
        .maybe_poller(poller)
        .maybe_metrics(metrics)
        .build();

    let router = build_router(state)?;
    Ok((router, shutdown.drop_guard()))
}
