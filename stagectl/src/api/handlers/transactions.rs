use crate::{
    api::models::transactions::{CreditTransactionCreate, CreditTransactionResponse, ListTransactionsQuery},
    auth::CurrentUser,
    db::models::credits::CreditTransactionType,
    errors::{Error, Result},
    types::TransactionId,
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

/// Record a manual credit adjustment
#[utoipa::path(
    post,
    path = "/transactions",
    tag = "transactions",
    summary = "Create a credit transaction",
    description = "Grant, refund or deduct credits by hand (operators only). Amounts are always positive; usage is stored as a debit and is refused when the user cannot cover it.",
    request_body = CreditTransactionCreate,
    responses(
        (status = 201, description = "Transaction created successfully", body = CreditTransactionResponse),
        (status = 400, description = "Bad request - invalid amount"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Usage exceeds the user's available credits"),
        (status = 403, description = "Forbidden - operators only"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn create_transaction(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(data): Json<CreditTransactionCreate>,
) -> Result<(StatusCode, Json<CreditTransactionResponse>)> {
    current_user.require_admin()?;

    let transaction = match data.transaction_type {
        CreditTransactionType::Purchase | CreditTransactionType::Bonus => {
            state
                .ledger
                .add(data.user_id, data.amount, data.transaction_type, data.description)
                .await?
        }
        CreditTransactionType::Refund => {
            state
                .ledger
                .refund(data.user_id, data.amount, data.related_image_id, data.description)
                .await?
        }
        CreditTransactionType::Usage => {
            let description = data.description.unwrap_or_else(|| "Manual adjustment".to_string());
            state
                .ledger
                .consume(data.user_id, data.amount, &description, data.related_image_id)
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(CreditTransactionResponse::from(transaction))))
}

#[utoipa::path(
    get,
    path = "/transactions/{transaction_id}",
    tag = "transactions",
    summary = "Get a specific transaction",
    description = "Non-operators can only access their own transactions.",
    params(("transaction_id" = String, Path, description = "Transaction ID")),
    responses(
        (status = 200, description = "Transaction details", body = CreditTransactionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Transaction not found"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<TransactionId>,
    current_user: CurrentUser,
) -> Result<Json<CreditTransactionResponse>> {
    let transaction = state.ledger.get_transaction(transaction_id).await?;
    // 404 rather than 403 so ids of other users' rows are not confirmed
    if !current_user.can_access(transaction.user_id) {
        return Err(Error::not_found("Transaction", transaction_id));
    }
    Ok(Json(CreditTransactionResponse::from(transaction)))
}

/// List credit transactions, newest first
#[utoipa::path(
    get,
    path = "/transactions",
    tag = "transactions",
    summary = "List credit transactions",
    description = "Non-operators only see their own transactions. Operators see everyone's unless user_id is given.",
    params(ListTransactionsQuery),
    responses(
        (status = 200, description = "List of transactions", body = [CreditTransactionResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - cannot access other users' transactions"),
    ),
    security(("X-Stage-User" = []))
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<ListTransactionsQuery>,
    current_user: CurrentUser,
) -> Result<Json<Vec<CreditTransactionResponse>>> {
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);

    let filter_user_id = match query.user_id {
        Some(requested) => {
            if requested != current_user.id {
                current_user.require_admin()?;
            }
            Some(requested)
        }
        None if current_user.is_admin => None,
        None => Some(current_user.id),
    };

    let transactions = state.ledger.list_transactions(filter_user_id, skip, limit).await?;
    Ok(Json(transactions.into_iter().map(CreditTransactionResponse::from).collect()))
}
