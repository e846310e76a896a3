use crate::{
    db::models::{
        credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
        reservations::{ReservationCreateDBRequest, ReservationDBResponse, SettlementMetadata, SettlementOutcome},
    },
    errors::Result,
    types::{ReservationId, TransactionId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The transactional store behind the ledger.
///
/// `reserve` and `debit` are the only operations that read-then-write the
/// balance, and implementations must perform each as one atomic step. Every
/// other mutation is a plain append or a conditional status flip.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Balance, live holds and totals for one user. Zeroes for unknown users.
    async fn stats(&self, user_id: UserId) -> Result<CreditStats>;

    async fn get_balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self.stats(user_id).await?.balance)
    }

    /// Append a credit row. Debits go through [`LedgerStore::debit`].
    async fn append_transaction(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse>;

    /// Append a usage row only if available credits cover it, else
    /// `InsufficientCredits`.
    async fn debit(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse>;

    /// Open a pending hold only if available credits cover it, else
    /// `InsufficientCredits`.
    async fn reserve(&self, request: &ReservationCreateDBRequest) -> Result<ReservationDBResponse>;

    /// `pending -> confirmed` plus exactly one usage row; no-op otherwise.
    async fn confirm_reservation(&self, id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome>;

    /// `pending -> cancelled`, no ledger row; no-op otherwise.
    async fn cancel_reservation(&self, id: ReservationId, reason: &str) -> Result<SettlementOutcome>;

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<ReservationDBResponse>>;

    /// Newest first. `None` lists every user.
    async fn list_transactions(&self, user_id: Option<UserId>, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<CreditTransactionDBResponse>>;

    /// Cancel pending holds whose expiry is at or before `now`
    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<ReservationDBResponse>>;
}
