use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};

use crate::{api, auth, jobs, provider};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-Stage-User".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-Stage-User"))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    servers(
        (url = "/api/v1", description = "Staging API server")
    ),
    modifiers(&SecurityAddon),
    paths(
        api::handlers::jobs::create_job,
        api::handlers::jobs::list_jobs,
        api::handlers::jobs::get_job,
        api::handlers::jobs::generate,
        api::handlers::jobs::regenerate,
        api::handlers::jobs::refresh_status,
        api::handlers::credits::get_balance,
        api::handlers::transactions::create_transaction,
        api::handlers::transactions::get_transaction,
        api::handlers::transactions::list_transactions,
        api::handlers::webhooks::generation_callback,
    ),
    components(
        schemas(
            api::models::jobs::JobCreate,
            api::models::jobs::JobResponse,
            api::models::credits::CreditBalanceResponse,
            api::models::transactions::CreditTransactionCreate,
            api::models::transactions::CreditTransactionResponse,
            auth::CurrentUser,
            jobs::JobStatus,
            provider::TaskReport,
            provider::TaskState,
            crate::db::models::credits::CreditTransactionType,
        )
    ),
    tags(
        (name = "jobs", description = "Image transformation jobs"),
        (name = "credits", description = "Credit balance"),
        (name = "transactions", description = "Credit ledger entries"),
        (name = "webhooks", description = "Provider callbacks"),
    ),
    info(
        title = "Stagectl API",
        version = "0.3.0",
        description = "Credits, reservations and generation jobs for virtual home staging",
    ),
)]
pub struct ApiDoc;
