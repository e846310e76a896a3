use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{available_credits, credits::insert_transaction, lock_user_ledger},
        models::{
            credits::{CreditTransactionCreateDBRequest, CreditTransactionType},
            reservations::{ReservationCreateDBRequest, ReservationDBResponse, ReservationStatus, ReserveOutcome, SettlementMetadata, SettlementOutcome},
        },
    },
    types::{ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use sqlx::{Connection, FromRow, PgConnection};
use tracing::{debug, trace};

// Database entity model for credit reservation
#[derive(Debug, Clone, FromRow)]
pub struct CreditReservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub amount: i64,
    pub operation_tag: String,
    pub status: ReservationStatus,
    pub metadata: Option<serde_json::Value>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<CreditReservation> for ReservationDBResponse {
    type Error = DbError;

    fn try_from(row: CreditReservation) -> Result<Self> {
        let metadata = row.metadata.map(serde_json::from_value::<SettlementMetadata>).transpose()?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            operation_tag: row.operation_tag,
            status: row.status,
            metadata,
            cancel_reason: row.cancel_reason,
            created_at: row.created_at,
            expires_at: row.expires_at,
            settled_at: row.settled_at,
        })
    }
}

/// Partial unique index keeping one pending hold per operation tag
const PENDING_TAG_INDEX: &str = "idx_credit_reservations_pending_tag";

const RESERVATION_COLUMNS: &str = "id, user_id, amount, operation_tag, status, metadata, cancel_reason, created_at, expires_at, settled_at";

pub struct Reservations<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Reservations<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Atomically check available credits and open a pending hold.
    ///
    /// The check and the insert share one transaction holding the user's
    /// ledger lock, so concurrent callers are admitted strictly one at a time
    /// and only as many holds succeed as the balance covers. A second pending
    /// hold for the same operation tag is refused as `TagHeld`.
    pub async fn reserve(&mut self, request: &ReservationCreateDBRequest) -> Result<ReserveOutcome> {
        let mut tx = self.db.begin().await?;

        lock_user_ledger(&mut tx, request.user_id).await?;

        let held = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM credit_reservations WHERE operation_tag = $1 AND status = 'pending')",
        )
        .bind(&request.operation_tag)
        .fetch_one(&mut *tx)
        .await?;
        if held {
            debug!("Refusing reservation for user_id {}: {} already held", request.user_id, request.operation_tag);
            tx.rollback().await?;
            return Ok(ReserveOutcome::TagHeld);
        }

        let available = available_credits(&mut tx, request.user_id).await?;
        if available < request.amount {
            debug!(
                "Refusing reservation of {} for user_id {}: {} available",
                request.amount, request.user_id, available
            );
            tx.rollback().await?;
            return Ok(ReserveOutcome::Insufficient { available });
        }

        let query = format!(
            r#"
            INSERT INTO credit_reservations (user_id, amount, operation_tag, status, expires_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(request.user_id)
            .bind(request.amount)
            .bind(&request.operation_tag)
            .bind(request.expires_at)
            .fetch_one(&mut *tx)
            .await;
        let reservation = match inserted.map_err(DbError::from) {
            Ok(reservation) => reservation,
            Err(DbError::UniqueViolation {
                constraint: Some(constraint),
                ..
            }) if constraint == PENDING_TAG_INDEX => {
                tx.rollback().await?;
                return Ok(ReserveOutcome::TagHeld);
            }
            Err(e) => return Err(e),
        };

        tx.commit().await?;
        trace!("Reserved {} for user_id {} as {}", reservation.amount, reservation.user_id, reservation.id);

        Ok(ReserveOutcome::Reserved(reservation.try_into()?))
    }

    /// Flip a live pending reservation to confirmed and append its usage row in
    /// one transaction. Returns `None` for an unknown id.
    ///
    /// A hold past its `expires_at` no longer counts against the balance, so
    /// its credits may already back another reservation. Such a hold is
    /// cancelled instead and reported as `Expired`.
    pub async fn confirm(&mut self, id: ReservationId, metadata: &SettlementMetadata) -> Result<Option<SettlementOutcome>> {
        let mut tx = self.db.begin().await?;

        let query = format!(
            r#"
            UPDATE credit_reservations
            SET status = 'confirmed', metadata = $2, settled_at = NOW()
            WHERE id = $1 AND status = 'pending' AND (expires_at IS NULL OR expires_at > NOW())
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(id)
            .bind(serde_json::to_value(metadata)?)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            if let Some(lapsed) = self.cancel_lapsed(id).await? {
                debug!("Refusing to confirm reservation {} past its expiry", id);
                return Ok(Some(SettlementOutcome::Expired { reservation: lapsed }));
            }
            return self.already_settled(id).await;
        };

        let usage = CreditTransactionCreateDBRequest {
            user_id: updated.user_id,
            transaction_type: CreditTransactionType::Usage,
            amount: -updated.amount,
            description: Some(format!("Image generation ({})", updated.operation_tag)),
            related_image_id: Some(metadata.job_id()),
            related_invoice_id: None,
            reservation_id: Some(updated.id),
        };
        let transaction = insert_transaction(&mut tx, &usage).await?;

        tx.commit().await?;

        Ok(Some(SettlementOutcome::Confirmed {
            reservation: updated.try_into()?,
            transaction: transaction.into(),
        }))
    }

    /// Release a pending hold. No ledger row is written.
    pub async fn cancel(&mut self, id: ReservationId, reason: &str) -> Result<Option<SettlementOutcome>> {
        let query = format!(
            r#"
            UPDATE credit_reservations
            SET status = 'cancelled', cancel_reason = $2, settled_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(id)
            .bind(reason)
            .fetch_optional(&mut *self.db)
            .await?;

        match updated {
            Some(reservation) => Ok(Some(SettlementOutcome::Cancelled {
                reservation: reservation.try_into()?,
            })),
            None => self.already_settled(id).await,
        }
    }

    pub async fn get(&mut self, id: ReservationId) -> Result<Option<ReservationDBResponse>> {
        let query = format!("SELECT {RESERVATION_COLUMNS} FROM credit_reservations WHERE id = $1");
        let reservation = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        reservation.map(ReservationDBResponse::try_from).transpose()
    }

    /// Cancel every pending reservation whose hold lapsed at or before `now`
    pub async fn expire_stale(&mut self, now: DateTime<Utc>) -> Result<Vec<ReservationDBResponse>> {
        let query = format!(
            r#"
            UPDATE credit_reservations
            SET status = 'cancelled', cancel_reason = 'expired', settled_at = NOW()
            WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= $1
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let expired = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(now)
            .fetch_all(&mut *self.db)
            .await?;
        expired.into_iter().map(ReservationDBResponse::try_from).collect()
    }

    async fn cancel_lapsed(&mut self, id: ReservationId) -> Result<Option<ReservationDBResponse>> {
        let query = format!(
            r#"
            UPDATE credit_reservations
            SET status = 'cancelled', cancel_reason = 'expired', settled_at = NOW()
            WHERE id = $1 AND status = 'pending' AND expires_at IS NOT NULL AND expires_at <= NOW()
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let lapsed = sqlx::query_as::<_, CreditReservation>(&query)
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        lapsed.map(ReservationDBResponse::try_from).transpose()
    }

    async fn already_settled(&mut self, id: ReservationId) -> Result<Option<SettlementOutcome>> {
        Ok(self.get(id).await?.map(|reservation| {
            debug_assert_ne!(reservation.status, ReservationStatus::Pending);
            SettlementOutcome::AlreadySettled { reservation }
        }))
    }
}
