use crate::{
    api::models::credits::{CreditBalanceQuery, CreditBalanceResponse},
    auth::CurrentUser,
    errors::Result,
    AppState,
};
use axum::{
    extract::{Query, State},
    response::Json,
};

/// Current balance projection for the caller
#[utoipa::path(
    get,
    path = "/credits",
    tag = "credits",
    summary = "Get credit balance",
    description = "Balance, credits held by pending generations and what is available to spend. Operators may pass user_id to inspect another account.",
    params(CreditBalanceQuery),
    responses(
        (status = 200, description = "Balance projection", body = CreditBalanceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - cannot read other users' balances"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn get_balance(
    State(state): State<AppState>,
    Query(query): Query<CreditBalanceQuery>,
    current_user: CurrentUser,
) -> Result<Json<CreditBalanceResponse>> {
    let user_id = match query.user_id {
        Some(user_id) if user_id != current_user.id => {
            current_user.require_admin()?;
            user_id
        }
        _ => current_user.id,
    };

    let stats = state.ledger.get_stats(user_id).await?;
    Ok(Json(CreditBalanceResponse::new(user_id, stats)))
}
