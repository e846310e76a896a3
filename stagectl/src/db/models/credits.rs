use crate::types::{JobId, ReservationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Credit transaction type enum stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    Purchase,
    Usage,
    Refund,
    Bonus,
}

impl CreditTransactionType {
    /// Usage rows are debits and carry a negative amount; everything else credits the user.
    pub fn is_debit(&self) -> bool {
        matches!(self, CreditTransactionType::Usage)
    }

    /// Whether `amount` has the sign this type requires. Zero is never valid.
    pub fn accepts_amount(&self, amount: i64) -> bool {
        if self.is_debit() {
            amount < 0
        } else {
            amount > 0
        }
    }
}

/// Database request for creating a new credit transaction
#[derive(Debug, Clone)]
pub struct CreditTransactionCreateDBRequest {
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    /// Signed amount: negative for usage, positive otherwise
    pub amount: i64,
    pub description: Option<String>,
    pub related_image_id: Option<JobId>,
    pub related_invoice_id: Option<Uuid>,
    pub reservation_id: Option<ReservationId>,
}

impl CreditTransactionCreateDBRequest {
    pub fn new(user_id: UserId, transaction_type: CreditTransactionType, amount: i64) -> Self {
        Self {
            user_id,
            transaction_type,
            amount,
            description: None,
            related_image_id: None,
            related_invoice_id: None,
            reservation_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_related_image(mut self, image_id: Option<JobId>) -> Self {
        self.related_image_id = image_id;
        self
    }
}

/// Database response for a credit transaction
#[derive(Debug, Clone, PartialEq)]
pub struct CreditTransactionDBResponse {
    pub id: Uuid,
    pub user_id: UserId,
    pub transaction_type: CreditTransactionType,
    pub amount: i64,
    pub description: Option<String>,
    pub related_image_id: Option<JobId>,
    pub related_invoice_id: Option<Uuid>,
    pub reservation_id: Option<ReservationId>,
    pub created_at: DateTime<Utc>,
}

/// Read-side projection of a user's ledger. Derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CreditStats {
    /// Sum of all transaction amounts
    pub balance: i64,
    /// Sum of live pending reservation amounts
    pub pending: i64,
    /// `balance - pending`
    pub available: i64,
    pub total_purchased: i64,
    /// Total consumed, as a positive number
    pub total_used: i64,
}

impl CreditStats {
    pub fn new(balance: i64, pending: i64, total_purchased: i64, total_used: i64) -> Self {
        Self {
            balance,
            pending,
            available: balance - pending,
            total_purchased,
            total_used,
        }
    }
}

/// Result of an atomic check-and-debit
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    Applied(CreditTransactionDBResponse),
    Insufficient { available: i64 },
}
