use crate::{
    db::models::credits::{CreditTransactionDBResponse, CreditTransactionType},
    types::{JobId, ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

// Request models
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditTransactionCreate {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// `purchase` and `bonus` add credits, `refund` returns them, `usage` deducts them
    pub transaction_type: CreditTransactionType,
    /// Amount of credits (absolute value)
    pub amount: i64,
    pub description: Option<String>,
    /// Image the adjustment relates to, for refunds and manual usage
    #[schema(value_type = Option<String>, format = "uuid")]
    pub related_image_id: Option<JobId>,
}

// Response models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CreditTransactionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    /// Signed amount: negative for usage
    pub amount: i64,
    pub description: Option<String>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub related_image_id: Option<JobId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub related_invoice_id: Option<Uuid>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub reservation_id: Option<ReservationId>,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for listing transactions
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListTransactionsQuery {
    /// Filter by user ID (operators only for other users)
    #[param(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,

    /// Number of items to skip
    pub skip: Option<i64>,

    /// Maximum number of items to return
    pub limit: Option<i64>,
}

impl From<CreditTransactionDBResponse> for CreditTransactionResponse {
    fn from(db: CreditTransactionDBResponse) -> Self {
        Self {
            id: db.id,
            user_id: db.user_id,
            transaction_type: db.transaction_type,
            amount: db.amount,
            description: db.description,
            related_image_id: db.related_image_id,
            related_invoice_id: db.related_invoice_id,
            reservation_id: db.reservation_id,
            created_at: db.created_at,
        }
    }
}
