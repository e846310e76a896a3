use crate::{
    db::{
        errors::DbError,
        handlers::{Credits, Reservations},
        models::{
            credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse, DebitOutcome},
            reservations::{ReservationCreateDBRequest, ReservationDBResponse, ReserveOutcome, SettlementMetadata, SettlementOutcome},
        },
    },
    errors::{Error, Result},
    ledger::store::LedgerStore,
    types::{ReservationId, TransactionId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{pool::PoolConnection, PgPool, Postgres};

/// [`LedgerStore`] backed by the `credit_transactions` and
/// `credit_reservations` tables.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(|e| Error::Database(e.into()))
    }
}

fn reservation_not_found(id: ReservationId) -> Error {
    Error::not_found("Reservation", id)
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn stats(&self, user_id: UserId) -> Result<CreditStats> {
        let mut conn = self.conn().await?;
        Ok(Credits::new(&mut conn).get_user_stats(user_id).await?)
    }

    async fn get_balance(&self, user_id: UserId) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(Credits::new(&mut conn).get_user_balance(user_id).await?)
    }

    async fn append_transaction(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let mut conn = self.conn().await?;
        match Credits::new(&mut conn).create_transaction(request).await {
            Ok(transaction) => Ok(transaction),
            Err(DbError::CheckViolation { .. }) => Err(Error::validation(format!(
                "amount {} is not valid for a {:?} transaction",
                request.amount, request.transaction_type
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn debit(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let mut conn = self.conn().await?;
        match Credits::new(&mut conn).debit_if_available(request).await? {
            DebitOutcome::Applied(transaction) => Ok(transaction),
            DebitOutcome::Insufficient { available } => Err(Error::insufficient_credits(-request.amount, available)),
        }
    }

    async fn reserve(&self, request: &ReservationCreateDBRequest) -> Result<ReservationDBResponse> {
        let mut conn = self.conn().await?;
        match Reservations::new(&mut conn).reserve(request).await? {
            ReserveOutcome::Reserved(reservation) => Ok(reservation),
            ReserveOutcome::Insufficient { available } => Err(Error::insufficient_credits(request.amount, available)),
            ReserveOutcome::TagHeld => Err(Error::ReservationHeld {
                operation_tag: request.operation_tag.clone(),
            }),
        }
    }

    async fn confirm_reservation(&self, id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome> {
        let mut conn = self.conn().await?;
        Reservations::new(&mut conn)
            .confirm(id, metadata)
            .await?
            .ok_or_else(|| reservation_not_found(id))
    }

    async fn cancel_reservation(&self, id: ReservationId, reason: &str) -> Result<SettlementOutcome> {
        let mut conn = self.conn().await?;
        Reservations::new(&mut conn)
            .cancel(id, reason)
            .await?
            .ok_or_else(|| reservation_not_found(id))
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<ReservationDBResponse>> {
        let mut conn = self.conn().await?;
        Ok(Reservations::new(&mut conn).get(id).await?)
    }

    async fn list_transactions(&self, user_id: Option<UserId>, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        let mut conn = self.conn().await?;
        let mut repo = Credits::new(&mut conn);
        let transactions = match user_id {
            Some(user_id) => repo.list_user_transactions(user_id, skip, limit).await?,
            None => repo.list_all_transactions(skip, limit).await?,
        };
        Ok(transactions)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<CreditTransactionDBResponse>> {
        let mut conn = self.conn().await?;
        Ok(Credits::new(&mut conn).get_transaction_by_id(id).await?)
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<ReservationDBResponse>> {
        let mut conn = self.conn().await?;
        Ok(Reservations::new(&mut conn).expire_stale(now).await?)
    }
}
