//! Reserve, execute, then confirm or cancel.
//!
//! Credits are held before any costed work starts and deducted only once the
//! work has produced its result. A failure at any point before confirmation
//! leaves the balance untouched; a reservation is deducted at most once.

use crate::{
    db::models::reservations::{ReservationCreateDBRequest, ReservationDBResponse, SettlementMetadata, SettlementOutcome},
    errors::{Error, Result},
    ledger::LedgerStore,
    metrics::GenerationMetrics,
    types::{ReservationId, UserId},
};
use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn LedgerStore>,
    /// How long an unsettled hold counts against the balance
    ttl: Option<Duration>,
    metrics: Option<GenerationMetrics>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn LedgerStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Option<GenerationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Hold `amount` credits, or fail with `InsufficientCredits` and no side effects.
    #[instrument(skip(self, operation_tag), err)]
    pub async fn reserve(&self, user_id: UserId, amount: i64, operation_tag: impl Into<String> + Send) -> Result<ReservationDBResponse> {
        if amount <= 0 {
            return Err(Error::validation(format!("reservation amount must be positive, got {amount}")));
        }

        let expires_at = match self.ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::Internal {
                    operation: format!("convert reservation ttl {ttl:?}"),
                })?;
                Some(Utc::now() + ttl)
            }
            None => None,
        };
        let request = ReservationCreateDBRequest {
            user_id,
            amount,
            operation_tag: operation_tag.into(),
            expires_at,
        };

        match self.store.reserve(&request).await {
            Ok(reservation) => {
                self.record_reservation("reserved");
                debug!(reservation_id = %reservation.id, tag = %reservation.operation_tag, "Reserved credits");
                Ok(reservation)
            }
            Err(e @ Error::InsufficientCredits { .. }) => {
                self.record_reservation("insufficient");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Settle a hold into exactly one usage transaction. Settling an already
    /// settled reservation is a no-op reported as `AlreadySettled`.
    pub async fn confirm(&self, reservation_id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome> {
        let outcome = self.store.confirm_reservation(reservation_id, metadata).await?;
        match &outcome {
            SettlementOutcome::Confirmed { transaction, .. } => {
                self.record_settlement("confirmed");
                info!(
                    %reservation_id,
                    transaction_id = %transaction.id,
                    settled_by = %metadata.settled_by(),
                    "Confirmed reservation"
                );
            }
            SettlementOutcome::Expired { .. } => {
                self.record_settlement("expired");
                warn!(%reservation_id, job_id = %metadata.job_id(), "Reservation expired before it could be confirmed");
            }
            other => debug!(%reservation_id, status = %other.reservation().status, "Reservation already settled"),
        }
        Ok(outcome)
    }

    /// Whether the hold still counts against the balance and can be confirmed
    pub async fn is_live(&self, reservation_id: ReservationId) -> Result<bool> {
        let reservation = self.store.get_reservation(reservation_id).await?;
        Ok(reservation.is_some_and(|r| r.holds_credits(Utc::now())))
    }

    /// Release a hold without touching the ledger. No-op unless pending.
    pub async fn cancel(&self, reservation_id: ReservationId, reason: &str) -> Result<SettlementOutcome> {
        let outcome = self.store.cancel_reservation(reservation_id, reason).await?;
        if outcome.applied() {
            self.record_settlement("cancelled");
            info!(%reservation_id, reason, "Cancelled reservation");
        } else {
            debug!(%reservation_id, status = %outcome.reservation().status, "Reservation already settled");
        }
        Ok(outcome)
    }

    /// Confirm after the costed work succeeded.
    ///
    /// If confirmation itself fails the hold is cancelled so it doesn't block
    /// the balance, and the caller gets `ReservationConfirmation`. The work's
    /// result must not be reported as a plain success in that case. A hold
    /// that expired first is reported the same way.
    pub async fn confirm_after_success(&self, reservation_id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome> {
        let confirm_error = match self.confirm(reservation_id, metadata).await {
            Ok(SettlementOutcome::Expired { .. }) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_settlement_failure();
                }
                error!(%reservation_id, job_id = %metadata.job_id(), "Operation succeeded after its reservation expired");
                return Err(Error::ReservationConfirmation {
                    reservation_id,
                    message: "reservation expired before confirmation".to_string(),
                });
            }
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_settlement_failure();
        }
        let user_id = self.store.get_reservation(reservation_id).await.ok().flatten().map(|r| r.user_id);
        error!(
            %reservation_id,
            user_id = ?user_id,
            job_id = %metadata.job_id(),
            error = %confirm_error,
            "Operation succeeded but its reservation could not be confirmed"
        );

        if let Err(cancel_error) = self.cancel(reservation_id, "confirmation failed").await {
            error!(%reservation_id, error = %cancel_error, "Compensating cancel failed");
        }

        Err(Error::ReservationConfirmation {
            reservation_id,
            message: confirm_error.to_string(),
        })
    }

    /// Run `operation` under a fresh hold of `amount` credits.
    ///
    /// The hold is confirmed with the metadata `operation` returns, or
    /// cancelled if it fails, in which case the original error is returned.
    pub async fn run<T, F, Fut>(&self, user_id: UserId, amount: i64, operation_tag: &str, operation: F) -> Result<(T, SettlementOutcome)>
    where
        F: FnOnce(ReservationDBResponse) -> Fut,
        Fut: Future<Output = Result<(T, SettlementMetadata)>>,
    {
        let reservation = self.reserve(user_id, amount, operation_tag).await?;
        let reservation_id = reservation.id;

        match operation(reservation).await {
            Ok((value, metadata)) => {
                let outcome = self.confirm_after_success(reservation_id, &metadata).await?;
                Ok((value, outcome))
            }
            Err(e) => {
                if let Err(cancel_error) = self.cancel(reservation_id, &e.to_string()).await {
                    warn!(%reservation_id, error = %cancel_error, "Failed to cancel reservation after operation error");
                }
                Err(e)
            }
        }
    }

    fn record_reservation(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_reservation(outcome);
        }
    }

    fn record_settlement(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_settlement(kind);
        }
    }
}
