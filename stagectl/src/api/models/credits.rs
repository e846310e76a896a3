use crate::{db::models::credits::CreditStats, types::UserId};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CreditBalanceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Sum of all transactions
    pub balance: i64,
    /// Credits held by unsettled reservations
    pub pending: i64,
    /// What a new generation can draw on
    pub available: i64,
    pub total_purchased: i64,
    pub total_used: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CreditBalanceQuery {
    /// Look up another user's balance (operators only)
    #[param(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
}

impl CreditBalanceResponse {
    pub fn new(user_id: UserId, stats: CreditStats) -> Self {
        Self {
            user_id,
            balance: stats.balance,
            pending: stats.pending,
            available: stats.available,
            total_purchased: stats.total_purchased,
            total_used: stats.total_used,
        }
    }
}
