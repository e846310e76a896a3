//! The credit ledger: an append-only log of signed transactions per user.
//!
//! A user's balance is always the sum of their transaction amounts. There is
//! no mutable balance column to drift out of sync; [`cache::CachedLedgerStore`]
//! is a disposable projection on top.

pub mod cache;
pub mod postgres;
pub mod store;

use crate::{
    db::models::credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse, CreditTransactionType},
    errors::{Error, Result},
    types::{JobId, TransactionId, UserId},
};
use std::sync::Arc;
use tracing::{info, instrument};

pub use store::LedgerStore;

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(Error::validation(format!("amount must be a positive integer, got {amount}")));
    }
    Ok(())
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Sum of all transactions. Users with no history have a balance of 0.
    pub async fn get_balance(&self, user_id: UserId) -> Result<i64> {
        self.store.get_balance(user_id).await
    }

    pub async fn get_stats(&self, user_id: UserId) -> Result<CreditStats> {
        self.store.stats(user_id).await
    }

    /// Debit `amount` credits directly, outside the reservation protocol.
    ///
    /// The availability check and the append happen in one store operation,
    /// and live reservations count against what can be consumed.
    #[instrument(skip(self, description), err)]
    pub async fn consume(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        related_image_id: Option<JobId>,
    ) -> Result<CreditTransactionDBResponse> {
        ensure_positive(amount)?;
        let request = CreditTransactionCreateDBRequest::new(user_id, CreditTransactionType::Usage, -amount)
            .with_description(description)
            .with_related_image(related_image_id);
        let transaction = self.store.debit(&request).await?;
        info!(%user_id, amount, transaction_id = %transaction.id, "Consumed credits");
        Ok(transaction)
    }

    /// Credit a purchase or bonus.
    #[instrument(skip(self, description), err)]
    pub async fn add(
        &self,
        user_id: UserId,
        amount: i64,
        transaction_type: CreditTransactionType,
        description: Option<String>,
    ) -> Result<CreditTransactionDBResponse> {
        if !matches!(transaction_type, CreditTransactionType::Purchase | CreditTransactionType::Bonus) {
            return Err(Error::validation(format!(
                "credits can only be added as purchase or bonus, not {transaction_type:?}"
            )));
        }
        ensure_positive(amount)?;

        let mut request = CreditTransactionCreateDBRequest::new(user_id, transaction_type, amount);
        request.description = description;
        let transaction = self.store.append_transaction(&request).await?;
        info!(%user_id, amount, transaction_id = %transaction.id, "Added credits");
        Ok(transaction)
    }

    #[instrument(skip(self, description), err)]
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        related_image_id: Option<JobId>,
        description: Option<String>,
    ) -> Result<CreditTransactionDBResponse> {
        ensure_positive(amount)?;
        let mut request =
            CreditTransactionCreateDBRequest::new(user_id, CreditTransactionType::Refund, amount).with_related_image(related_image_id);
        request.description = description;
        let transaction = self.store.append_transaction(&request).await?;
        info!(%user_id, amount, transaction_id = %transaction.id, "Refunded credits");
        Ok(transaction)
    }

    pub async fn list_transactions(&self, user_id: Option<UserId>, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        self.store.list_transactions(user_id, skip, limit).await
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<CreditTransactionDBResponse> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| Error::not_found("Transaction", id))
    }
}
