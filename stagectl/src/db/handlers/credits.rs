use crate::{
    db::{
        errors::Result,
        handlers::{available_credits, lock_user_ledger},
        models::credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse, CreditTransactionType, DebitOutcome},
    },
    types::{JobId, ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, FromRow, PgConnection};
use tracing::{debug, trace};
use uuid::Uuid;

// Database entity model for credit transaction
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
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

impl From<CreditTransaction> for CreditTransactionDBResponse {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            id: tx.id,
            user_id: tx.user_id,
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            description: tx.description,
            related_image_id: tx.related_image_id,
            related_invoice_id: tx.related_invoice_id,
            reservation_id: tx.reservation_id,
            created_at: tx.created_at,
        }
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, user_id, transaction_type, amount, description, related_image_id, related_invoice_id, reservation_id, created_at";

/// Append one row to the ledger. Callers that debit must hold the user's ledger lock.
pub(crate) async fn insert_transaction(conn: &mut PgConnection, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransaction> {
    let query = format!(
        r#"
        INSERT INTO credit_transactions (user_id, transaction_type, amount, description, related_image_id, related_invoice_id, reservation_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    );
    let transaction = sqlx::query_as::<_, CreditTransaction>(&query)
        .bind(request.user_id)
        .bind(request.transaction_type)
        .bind(request.amount)
        .bind(&request.description)
        .bind(request.related_image_id)
        .bind(request.related_invoice_id)
        .bind(request.reservation_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(transaction)
}

pub struct Credits<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Credits<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Append a credit (purchase, bonus, refund). The table's check constraints
    /// reject amounts with the wrong sign for the type.
    pub async fn create_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let transaction = insert_transaction(&mut *self.db, request).await?;
        trace!("Appended {:?} of {} for user_id {}", transaction.transaction_type, transaction.amount, transaction.user_id);
        Ok(CreditTransactionDBResponse::from(transaction))
    }

    /// Check available credits and append the debit in one transaction.
    /// `request.amount` is the negative usage amount.
    pub async fn debit_if_available(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<DebitOutcome> {
        let mut tx = self.db.begin().await?;

        lock_user_ledger(&mut tx, request.user_id).await?;

        let available = available_credits(&mut tx, request.user_id).await?;
        let required = -request.amount;
        if available < required {
            debug!("Refusing debit of {} for user_id {}: {} available", required, request.user_id, available);
            tx.rollback().await?;
            return Ok(DebitOutcome::Insufficient { available });
        }

        let transaction = insert_transaction(&mut tx, request).await?;
        tx.commit().await?;

        Ok(DebitOutcome::Applied(transaction.into()))
    }

    /// Sum of all transactions for the user, 0 when there are none
    pub async fn get_user_balance(&mut self, user_id: UserId) -> Result<i64> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_transactions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(balance)
    }

    pub async fn get_user_stats(&mut self, user_id: UserId) -> Result<CreditStats> {
        let (balance, pending, total_purchased, total_used) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                COALESCE((SELECT SUM(amount) FROM credit_transactions WHERE user_id = $1), 0)::BIGINT,
                COALESCE((
                    SELECT SUM(amount) FROM credit_reservations
                    WHERE user_id = $1
                      AND status = 'pending'
                      AND (expires_at IS NULL OR expires_at > NOW())
                ), 0)::BIGINT,
                COALESCE((SELECT SUM(amount) FROM credit_transactions WHERE user_id = $1 AND transaction_type = 'purchase'), 0)::BIGINT,
                COALESCE((SELECT -SUM(amount) FROM credit_transactions WHERE user_id = $1 AND transaction_type = 'usage'), 0)::BIGINT
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(CreditStats::new(balance, pending, total_purchased, total_used))
    }

    /// List transactions for a specific user with pagination
    pub async fn list_user_transactions(&mut self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#
        );
        let transactions = sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(user_id)
            .bind(skip)
            .bind(limit)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(transactions.into_iter().map(CreditTransactionDBResponse::from).collect())
    }

    /// List all transactions across all users (admin view)
    pub async fn list_all_transactions(&mut self, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            ORDER BY created_at DESC, id DESC
            OFFSET $1
            LIMIT $2
            "#
        );
        let transactions = sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(skip)
            .bind(limit)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(transactions.into_iter().map(CreditTransactionDBResponse::from).collect())
    }

    /// Get a single transaction by its ID
    pub async fn get_transaction_by_id(&mut self, transaction_id: Uuid) -> Result<Option<CreditTransactionDBResponse>> {
        let query = format!("SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE id = $1");
        let transaction = sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(transaction_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(transaction.map(CreditTransactionDBResponse::from))
    }
}
